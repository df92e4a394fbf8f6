//! User-agent heuristics for the device catalog.
//!
//! Deliberately small: the catalog only needs a human-readable device line,
//! not full UA intelligence. Order matters — Edge and Opera advertise
//! Chrome, Chrome advertises Safari.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_name: String,
    pub browser: String,
    pub os: String,
    pub device_type: String,
}

#[must_use]
pub fn parse(user_agent: &str) -> DeviceInfo {
    let os = detect_os(user_agent);
    let browser = detect_browser(user_agent);
    let device_type = detect_device_type(user_agent, os);
    let device_name = device_name(user_agent, os);

    DeviceInfo {
        device_name: device_name.to_string(),
        browser: browser.to_string(),
        os: os.to_string(),
        device_type: device_type.to_string(),
    }
}

fn detect_os(ua: &str) -> &'static str {
    if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iOS") {
        "iOS"
    } else if ua.contains("Android") {
        "Android"
    } else if ua.contains("CrOS") {
        "ChromeOS"
    } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
        "macOS"
    } else if ua.contains("Windows") {
        "Windows"
    } else if ua.contains("Linux") {
        "Linux"
    } else {
        "Unknown"
    }
}

fn detect_browser(ua: &str) -> &'static str {
    if ua.contains("Edg/") || ua.contains("Edge/") {
        "Edge"
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        "Opera"
    } else if ua.contains("Chrome/") || ua.contains("CriOS/") {
        "Chrome"
    } else if ua.contains("Firefox/") || ua.contains("FxiOS/") {
        "Firefox"
    } else if ua.contains("Safari/") {
        "Safari"
    } else if ua.contains("MSIE") || ua.contains("Trident/") {
        "Internet Explorer"
    } else {
        "Unknown"
    }
}

fn detect_device_type(ua: &str, os: &str) -> &'static str {
    if ua.contains("iPad") || (os == "Android" && !ua.contains("Mobile")) || ua.contains("Tablet") {
        "tablet"
    } else if ua.contains("iPhone") || (os == "Android" && ua.contains("Mobile")) {
        "mobile"
    } else if matches!(os, "macOS" | "Windows" | "Linux" | "ChromeOS") {
        "desktop"
    } else {
        "unknown"
    }
}

fn device_name(ua: &str, os: &str) -> &'static str {
    if ua.contains("iPhone") {
        "iPhone"
    } else if ua.contains("iPad") {
        "iPad"
    } else {
        match os {
            "Android" => "Android device",
            "macOS" => "Mac",
            "Windows" => "Windows PC",
            "Linux" => "Linux PC",
            "ChromeOS" => "Chromebook",
            _ => "Unknown device",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const EDGE_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0";
    const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
    const CHROME_ANDROID_PHONE: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";
    const CHROME_ANDROID_TABLET: &str = "Mozilla/5.0 (Linux; Android 14; SM-X910) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const FIREFOX_LINUX: &str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";
    const SAFARI_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15";
    const CHROMEBOOK: &str = "Mozilla/5.0 (X11; CrOS x86_64 14541.0.0) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    #[test]
    fn edge_is_not_chrome() {
        let info = parse(EDGE_WINDOWS);
        assert_eq!(info.browser, "Edge");
        assert_eq!(info.os, "Windows");
        assert_eq!(info.device_type, "desktop");
        assert_eq!(info.device_name, "Windows PC");
    }

    #[test]
    fn chrome_is_not_safari() {
        let info = parse(CHROME_WINDOWS);
        assert_eq!(info.browser, "Chrome");
    }

    #[test]
    fn iphone_is_mobile_ios() {
        let info = parse(SAFARI_IPHONE);
        assert_eq!(info.os, "iOS");
        assert_eq!(info.browser, "Safari");
        assert_eq!(info.device_type, "mobile");
        assert_eq!(info.device_name, "iPhone");
    }

    #[test]
    fn android_mobile_vs_tablet() {
        let phone = parse(CHROME_ANDROID_PHONE);
        assert_eq!(phone.device_type, "mobile");
        assert_eq!(phone.os, "Android");

        let tablet = parse(CHROME_ANDROID_TABLET);
        assert_eq!(tablet.device_type, "tablet");
    }

    #[test]
    fn desktop_platforms() {
        assert_eq!(parse(FIREFOX_LINUX).device_type, "desktop");
        assert_eq!(parse(FIREFOX_LINUX).browser, "Firefox");
        assert_eq!(parse(SAFARI_MAC).os, "macOS");
        assert_eq!(parse(SAFARI_MAC).browser, "Safari");
        assert_eq!(parse(CHROMEBOOK).os, "ChromeOS");
        assert_eq!(parse(CHROMEBOOK).device_name, "Chromebook");
    }

    #[test]
    fn empty_agent_is_unknown() {
        let info = parse("");
        assert_eq!(info.browser, "Unknown");
        assert_eq!(info.os, "Unknown");
        assert_eq!(info.device_type, "unknown");
        assert_eq!(info.device_name, "Unknown device");
    }
}
