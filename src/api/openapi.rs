use super::handlers::{auth, barcode, health};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated OpenAPI spec.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Build the router that also drives the `OpenAPI` document.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are both served
/// and included in the generated `OpenAPI` spec.
/// Routes added outside (like `/` or `OPTIONS /health`) are intentionally not
/// documented.
pub(crate) fn api_router() -> OpenApiRouter {
    // `routes!` reads #[utoipa::path] to bind HTTP method + path and add the
    // route to OpenAPI.
    let router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(auth::challenge::login_challenge))
        .routes(routes!(auth::login::login))
        .routes(routes!(auth::tokens::refresh))
        .routes(routes!(auth::tokens::logout))
        .routes(routes!(auth::register::register))
        .routes(routes!(auth::profile::user_info))
        .routes(routes!(auth::profile::get_profile, auth::profile::update_profile))
        .routes(routes!(auth::passkeys::register_options))
        .routes(routes!(auth::passkeys::register_verify))
        .routes(routes!(auth::passkeys::auth_options))
        .routes(routes!(auth::passkeys::auth_verify))
        .routes(routes!(auth::devices::list_devices))
        .routes(routes!(auth::devices::revoke_other_devices))
        .routes(routes!(auth::devices::revoke_device))
        .routes(routes!(barcode::generate::generate_barcode))
        .routes(routes!(
            barcode::dashboard::dashboard,
            barcode::dashboard::create_barcode,
            barcode::dashboard::update_settings,
            barcode::dashboard::patch_barcode,
            barcode::dashboard::delete_barcode
        ));

    router
}

fn service_tags() -> Vec<Tag> {
    let mut service_tag = Tag::new("tessera");
    service_tag.description = Some("Mobile identification and barcode API".to_string());

    let mut auth_tag = Tag::new("auth");
    auth_tag.description = Some("Challenge login, tokens, registration, profile".to_string());

    let mut passkeys_tag = Tag::new("passkeys");
    passkeys_tag.description = Some("WebAuthn passkey ceremonies".to_string());

    let mut devices_tag = Tag::new("devices");
    devices_tag.description = Some("Session and device management".to_string());

    let mut barcode_tag = Tag::new("barcode");
    barcode_tag.description = Some("Barcode issuance and dashboard".to_string());

    vec![service_tag, auth_tag, passkeys_tag, devices_tag, barcode_tag]
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new()
        .info(info)
        .tags(Some(service_tags()))
        .build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(';').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    if let Some(start) = author.find('<') {
        let name = author[..start].trim();
        let email = author[start + 1..].trim_end_matches('>').trim();
        let name = if name.is_empty() { None } else { Some(name) };
        let email = if email.is_empty() { None } else { Some(email) };
        (name, email)
    } else {
        let name = author.trim();
        (if name.is_empty() { None } else { Some(name) }, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_info_from_cargo() {
        let spec = openapi();
        assert_eq!(spec.info.title, env!("CARGO_PKG_NAME"));
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(
            spec.info.description.as_deref(),
            Some(env!("CARGO_PKG_DESCRIPTION"))
        );

        let contact = spec.info.contact;
        assert!(contact.is_some());
        if let Some(contact) = contact {
            assert_eq!(contact.name.as_deref(), Some("Team Tessera"));
            assert_eq!(contact.email.as_deref(), Some("team@tessera.dev"));
        }
    }

    #[test]
    fn openapi_tags_and_paths() {
        let spec = openapi();
        let tags = spec.tags.clone().unwrap_or_default();
        assert!(tags.iter().any(|tag| tag.name == "auth"));
        assert!(tags.iter().any(|tag| tag.name == "barcode"));
        assert!(spec.paths.paths.contains_key("/authn/login"));
        assert!(spec.paths.paths.contains_key("/authn/login/challenge"));
        assert!(spec.paths.paths.contains_key("/authn/token/refresh"));
        assert!(spec.paths.paths.contains_key("/authn/devices"));
        assert!(spec.paths.paths.contains_key("/generate_barcode"));
        assert!(spec.paths.paths.contains_key("/barcode_dashboard"));
    }
}
