use std::collections::BTreeSet;

use gwms_core::common::error::CoreError;

const SUBMIT_PROXY: &str = "SubmitProxy";
const GLIDEIN_PROXY: &str = "GlideinProxy";
const FRONTEND_SCITOKEN: &str = "frontend_scitoken";

/// Payload keys whose presence is checked against the entry auth method.
const RELEVANT_KEYS: [&str; 11] = [
    SUBMIT_PROXY,
    GLIDEIN_PROXY,
    "Username",
    "Password",
    "PublicCert",
    "PrivateCert",
    "PublicKey",
    "PrivateKey",
    "VMId",
    "VMType",
    "AuthFile",
];

const MAIN_METHODS: [&str; 7] = [
    "grid_proxy",
    "cert_pair",
    "key_pair",
    "auth_file",
    "username_password",
    "scitoken",
    "idtoken",
];

/// Names of clients and requests used in paths and constraints.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'))
}

fn required_and_allowed(method: &str) -> Option<(&'static [&'static str], &'static [&'static str])> {
    Some(match method {
        "cert_pair" => (
            &["PublicCert", "PrivateCert"],
            &[GLIDEIN_PROXY, "PublicCert", "PrivateCert", "VMId", "VMType"],
        ),
        "key_pair" => (
            &["PublicKey", "PrivateKey"],
            &[GLIDEIN_PROXY, "PublicKey", "PrivateKey", "VMId", "VMType"],
        ),
        "auth_file" => (&["AuthFile"], &[GLIDEIN_PROXY, "AuthFile", "VMId", "VMType"]),
        "username_password" => (
            &["Username", "Password"],
            &[GLIDEIN_PROXY, "Username", "Password", "VMId", "VMType"],
        ),
        _ => return None,
    })
}

/// Checks that a request carries exactly the credentials the entry auth method needs.
///
/// `auth_method` is the `+` joined method of the entry, `present` the decrypted payload keys.
pub fn check_security_credentials<'a>(
    auth_method: &str,
    present: impl IntoIterator<Item = &'a str>,
    client: &str,
    entry: &str,
    scitoken_passthru: bool,
) -> Result<(), CoreError> {
    let present: BTreeSet<&str> = present.into_iter().collect();
    let methods: Vec<&str> = auth_method.split('+').map(str::trim).collect();
    let Some(main) = methods.iter().copied().find(|m| MAIN_METHODS.contains(m)) else {
        log::warn!(
            "entry {entry}: no supported main auth method in `{auth_method}`, accepting request of {client}"
        );
        return Ok(());
    };

    if main == "scitoken" || (scitoken_passthru && present.contains(FRONTEND_SCITOKEN)) {
        return Ok(());
    }
    let relevant: BTreeSet<&str> = present
        .iter()
        .copied()
        .filter(|key| RELEVANT_KEYS.contains(key))
        .collect();

    if main == "grid_proxy" {
        if scitoken_passthru {
            return Ok(());
        }
        if !relevant.contains(SUBMIT_PROXY) {
            return Err(CoreError::invalid_input(format!(
                "Request of {client} for {entry} has no {SUBMIT_PROXY}"
            )));
        }
        if let Some(extra) = relevant.iter().find(|key| **key != SUBMIT_PROXY) {
            return Err(CoreError::invalid_input(format!(
                "Request of {client} for {entry} carries {extra}, not allowed with grid_proxy"
            )));
        }
        return Ok(());
    }

    if !scitoken_passthru && !relevant.contains(GLIDEIN_PROXY) {
        return Err(CoreError::invalid_input(format!(
            "Request of {client} for {entry} has no {GLIDEIN_PROXY}"
        )));
    }
    if main == "idtoken" {
        return Ok(());
    }
    let Some((required, allowed)) = required_and_allowed(main) else {
        return Ok(());
    };
    if let Some(missing) = required.iter().find(|key| !relevant.contains(*key)) {
        return Err(CoreError::invalid_input(format!(
            "Request of {client} for {entry} has no {missing}, required by {main}"
        )));
    }
    if let Some(extra) = relevant.iter().find(|key| !allowed.contains(*key)) {
        return Err(CoreError::invalid_input(format!(
            "Request of {client} for {entry} carries {extra}, not allowed with {main}"
        )));
    }
    Ok(())
}
