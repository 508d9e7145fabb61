//! AX.25 station addressing: callsign + SSID, and the digipeater path that frames carry
//! in their address header.

use std::fmt;

/// A single AX.25 station address: a 3-6 character uppercase alphanumeric callsign plus
/// a secondary station identifier (SSID) in `[0, 15]`.
///
/// Equality and hashing are case-insensitive on the callsign, matching how two stations
/// that differ only in case are in fact the same station on the air.
#[derive(Debug, Clone, Eq)]
pub struct Ax25Address {
    call: String,
    ssid: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("callsign must be 3-6 alphanumeric characters, got {0:?}")]
    InvalidCallsign(String),
    #[error("ssid must be in 0..=15, got {0}")]
    InvalidSsid(u8),
    #[error("malformed address string {0:?}")]
    Malformed(String),
}

impl Ax25Address {
    pub fn new(call: &str, ssid: u8) -> Result<Self, AddressError> {
        if ssid > 15 {
            return Err(AddressError::InvalidSsid(ssid));
        }
        let upper = call.to_ascii_uppercase();
        let len = upper.len();
        if !(3..=6).contains(&len) || !upper.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AddressError::InvalidCallsign(call.to_string()));
        }
        Ok(Ax25Address { call: upper, ssid })
    }

    /// Parses the conventional `CALL` or `CALL-N` display form.
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        match text.split_once('-') {
            Some((call, ssid_str)) => {
                let ssid: u8 = ssid_str
                    .parse()
                    .map_err(|_| AddressError::Malformed(text.to_string()))?;
                Ax25Address::new(call, ssid)
            }
            None => Ax25Address::new(text, 0),
        }
    }

    #[inline]
    pub fn call(&self) -> &str {
        &self.call
    }

    #[inline]
    pub fn ssid(&self) -> u8 {
        self.ssid
    }
}

impl PartialEq for Ax25Address {
    fn eq(&self, other: &Self) -> bool {
        self.call.eq_ignore_ascii_case(&other.call) && self.ssid == other.ssid
    }
}

impl std::hash::Hash for Ax25Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.call.to_ascii_uppercase().hash(state);
        self.ssid.hash(state);
    }
}

impl fmt::Display for Ax25Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.call)
        } else {
            write!(f, "{}-{}", self.call, self.ssid)
        }
    }
}

/// An ordered digipeater path, at most 8 stations. The empty path means "direct".
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct DigiPath(Vec<Ax25Address>);

#[derive(Debug, thiserror::Error)]
pub enum DigiPathError {
    #[error("digipeater path may contain at most 8 stations, got {0}")]
    TooLong(usize),
}

impl DigiPath {
    pub const MAX_LEN: usize = 8;

    pub fn new(stations: Vec<Ax25Address>) -> Result<Self, DigiPathError> {
        if stations.len() > Self::MAX_LEN {
            return Err(DigiPathError::TooLong(stations.len()));
        }
        Ok(DigiPath(stations))
    }

    pub fn direct() -> Self {
        DigiPath(Vec::new())
    }

    #[inline]
    pub fn stations(&self) -> &[Ax25Address] {
        &self.0
    }

    #[inline]
    pub fn is_direct(&self) -> bool {
        self.0.is_empty()
    }

    /// Comma-joined display form of the path; the empty string means "direct". This is
    /// the canonical key component used to distinguish sessions to the same peer reached
    /// via different digipeater paths.
    pub fn signature(&self) -> String {
        self.0
            .iter()
            .map(|addr| addr.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_form_omits_zero_ssid() {
        let addr = Ax25Address::new("n0bbb", 0).unwrap();
        assert_eq!(addr.to_string(), "N0BBB");
        let addr = Ax25Address::new("n0bbb", 2).unwrap();
        assert_eq!(addr.to_string(), "N0BBB-2");
    }

    #[test]
    fn equality_is_case_insensitive_on_call() {
        let a = Ax25Address::new("n0aaa", 1).unwrap();
        let b = Ax25Address::new("N0AAA", 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_bad_ssid_and_callsign() {
        assert!(Ax25Address::new("N0AAA", 16).is_err());
        assert!(Ax25Address::new("TOOLONGCALL", 0).is_err());
        assert!(Ax25Address::new("A!", 0).is_err());
    }

    #[test]
    fn path_signature_empty_means_direct() {
        let path = DigiPath::direct();
        assert_eq!(path.signature(), "");
        assert!(path.is_direct());
    }

    #[test]
    fn path_signature_joins_display_forms() {
        let path = DigiPath::new(vec![
            Ax25Address::new("WIDE1", 1).unwrap(),
            Ax25Address::new("WIDE2", 2).unwrap(),
        ])
        .unwrap();
        assert_eq!(path.signature(), "WIDE1-1,WIDE2-2");
    }

    #[test]
    fn rejects_overlong_path() {
        let stations: Vec<_> = (0..9)
            .map(|i| Ax25Address::new(&format!("W{}AAA", i), 0).unwrap())
            .collect();
        assert!(DigiPath::new(stations).is_err());
    }
}
