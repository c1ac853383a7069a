//! JWT bearer token validation and scope checks.
//!
//! The token arrives either in the transport's `Authorization` bearer
//! header or in the `secret_key` connection parameter. The engine owns
//! claim parsing and scope checks; signature validation is delegated to
//! `jsonwebtoken` with the tenant's key.
use jsonwebtoken::{Validation, decode};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    tenant::JwtKey,
};

/// Claim layout generation, selected by the token prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenVersion {
    /// `nbwt1_` / `edbt1_`: scoped `edb.*` claims.
    V1,
    /// `nbwt_` / `edbt_`: legacy `edgedb.server.*` claims.
    Legacy,
}

/// Accepted token prefixes, longest first so `nbwt1_` wins over `nbwt_`.
const PREFIXES: [(&str, TokenVersion); 4] = [
    ("nbwt1_", TokenVersion::V1),
    ("nbwt_", TokenVersion::Legacy),
    ("edbt1_", TokenVersion::V1),
    ("edbt_", TokenVersion::Legacy),
];

/// Split a prefixed token into its version and the raw JWT.
pub fn strip_prefix(token: &str) -> Result<(TokenVersion, &str)> {
    for (prefix, version) in PREFIXES {
        if let Some(rest) = token.strip_prefix(prefix) {
            return Ok((version, rest));
        }
    }
    Err(Error::auth("malformed scoped token"))
}

/// Validate signature and parse claims.
pub fn validate(token: &str, key: &JwtKey) -> Result<(TokenVersion, Value)> {
    let (version, raw) = strip_prefix(token)?;

    let mut validation = Validation::new(key.algorithm);
    // Veld tokens may be unexpiring; expiry is still enforced when present.
    validation.required_spec_claims.clear();
    validation.validate_aud = false;

    let data = decode::<Value>(raw, &key.key, &validation).map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::Json(_) => {
            Error::auth("malformed claims section in auth token")
        }
        _ => Error::auth(format!("invalid secret key: {e}")),
    })?;
    if !data.claims.is_object() {
        return Err(Error::auth("malformed claims section in auth token"));
    }

    Ok((version, data.claims))
}

/// The three optional scope sets parsed from claims.
///
/// `None` means "unconstrained"; membership checks are exact-string.
#[derive(Debug, Default, PartialEq)]
pub struct Scopes {
    pub roles: Option<Vec<String>>,
    pub instances: Option<Vec<String>>,
    pub databases: Option<Vec<String>>,
}

/// Extract the scope sets for the claim generation at hand.
pub fn parse_scopes(claims: &Value, version: TokenVersion) -> Result<Scopes> {
    match version {
        TokenVersion::V1 => Ok(Scopes {
            roles: scope_list(claims, "edb.r")?,
            instances: scope_list(claims, "edb.i")?,
            databases: scope_list(claims, "edb.d")?,
        }),
        TokenVersion::Legacy => {
            let any_role = claims
                .get("edgedb.server.any_role")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let roles = if any_role {
                None
            } else {
                string_list(claims.get("edgedb.server.roles"), "edgedb.server.roles")?
            };
            Ok(Scopes { roles, instances: None, databases: None })
        }
    }
}

/// Read `<claim>` as an optional string list; `<claim>.all: true` lifts the
/// constraint entirely.
fn scope_list(claims: &Value, name: &str) -> Result<Option<Vec<String>>> {
    let all = claims
        .get(format!("{name}.all"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if all {
        return Ok(None);
    }
    string_list(claims.get(name), name)
}

fn string_list(value: Option<&Value>, name: &str) -> Result<Option<Vec<String>>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| Error::auth(format!("malformed claim {name}")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(_) => Err(Error::auth(format!("malformed claim {name}"))),
    }
}

/// Enforce the scope sets against this connection's identity.
pub fn check_authz(
    scopes: &Scopes,
    instance_name: &str,
    dbname: &str,
    user: &str,
) -> Result<()> {
    if let Some(instances) = &scopes.instances
        && !instances.iter().any(|i| i == instance_name)
    {
        return Err(Error::auth(format!(
            "secret key does not authorize access to this instance \"{instance_name}\"",
        )));
    }
    if let Some(databases) = &scopes.databases
        && !databases.iter().any(|d| d == dbname)
    {
        return Err(Error::auth(format!(
            "secret key does not authorize access to database \"{dbname}\"",
        )));
    }
    if let Some(roles) = &scopes.roles
        && !roles.iter().any(|r| r == user)
    {
        return Err(Error::auth(format!(
            "secret key does not authorize access in role \"{user}\"",
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefixes_select_token_version() {
        assert_eq!(strip_prefix("nbwt1_abc").unwrap(), (TokenVersion::V1, "abc"));
        assert_eq!(strip_prefix("nbwt_abc").unwrap(), (TokenVersion::Legacy, "abc"));
        assert_eq!(strip_prefix("edbt1_abc").unwrap(), (TokenVersion::V1, "abc"));
        assert_eq!(strip_prefix("edbt_abc").unwrap(), (TokenVersion::Legacy, "abc"));
        assert!(strip_prefix("xyz_abc").is_err());
    }

    #[test]
    fn v1_scopes_parse_lists_and_all() {
        let claims = json!({
            "edb.r": ["admin"],
            "edb.i.all": true,
            "edb.d": ["main", "aux"],
        });
        let scopes = parse_scopes(&claims, TokenVersion::V1).unwrap();
        assert_eq!(scopes.roles, Some(vec!["admin".to_owned()]));
        assert_eq!(scopes.instances, None);
        assert_eq!(
            scopes.databases,
            Some(vec!["main".to_owned(), "aux".to_owned()]),
        );
    }

    #[test]
    fn legacy_scopes_honor_any_role() {
        let claims = json!({ "edgedb.server.roles": ["admin"] });
        let scopes = parse_scopes(&claims, TokenVersion::Legacy).unwrap();
        assert_eq!(scopes.roles, Some(vec!["admin".to_owned()]));

        let claims =
            json!({ "edgedb.server.any_role": true, "edgedb.server.roles": ["x"] });
        let scopes = parse_scopes(&claims, TokenVersion::Legacy).unwrap();
        assert_eq!(scopes.roles, None);
    }

    #[test]
    fn malformed_scope_list_is_an_error() {
        let claims = json!({ "edb.r": "admin" });
        assert!(parse_scopes(&claims, TokenVersion::V1).is_err());

        let claims = json!({ "edb.r": [1, 2] });
        assert!(parse_scopes(&claims, TokenVersion::V1).is_err());
    }

    #[test]
    fn authz_matrix() {
        let scopes = Scopes {
            roles: Some(vec!["admin".to_owned()]),
            instances: Some(vec!["prod".to_owned()]),
            databases: Some(vec!["main".to_owned()]),
        };

        check_authz(&scopes, "prod", "main", "admin").unwrap();

        let err = check_authz(&scopes, "prod", "other", "admin").unwrap_err();
        assert!(err.to_message().contains("access to database \"other\""));

        let err = check_authz(&scopes, "staging", "main", "admin").unwrap_err();
        assert!(err.to_message().contains("instance"));

        let err = check_authz(&scopes, "prod", "main", "intruder").unwrap_err();
        assert!(err.to_message().contains("role"));

        // Unconstrained sets admit anything.
        check_authz(&Scopes::default(), "x", "y", "z").unwrap();
    }
}
