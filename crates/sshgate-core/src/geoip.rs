//! GeoIP lookup contract used to label per-country metrics.

use std::net::IpAddr;

/// Country code returned when a lookup fails. Never a real country.
pub const UNKNOWN_COUNTRY: &str = "XX";

/// Resolves an IP address to a two-letter ISO 3166 country code.
///
/// Implementations return [`UNKNOWN_COUNTRY`] on any failure instead of an
/// error; metrics must keep flowing when the database is missing.
pub trait GeoIpLookup: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> String;
}

/// Lookup that knows no countries.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyLookup;

impl GeoIpLookup for DummyLookup {
    fn lookup(&self, _ip: IpAddr) -> String {
        UNKNOWN_COUNTRY.to_string()
    }
}

/// True for a plausible ISO country code, false for the lookup-failure sentinel.
pub fn is_known_country(code: &str) -> bool {
    code != UNKNOWN_COUNTRY && code.len() == 2 && code.bytes().all(|b| b.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_returns_sentinel() {
        let code = DummyLookup.lookup("8.8.8.8".parse().unwrap());
        assert_eq!(code, UNKNOWN_COUNTRY);
        assert!(!is_known_country(&code));
    }

    #[test]
    fn known_country() {
        assert!(is_known_country("DE"));
        assert!(!is_known_country("de"));
        assert!(!is_known_country("DEU"));
        assert!(!is_known_country(""));
    }
}
