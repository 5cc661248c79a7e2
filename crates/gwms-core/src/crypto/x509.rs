use chrono::{DateTime, TimeZone, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::x509::X509;

use crate::common::error::CoreError;

/// The parts of an X.509 certificate the services care about.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

fn to_datetime(time: &Asn1TimeRef) -> crate::Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let seconds = diff.days as i64 * 86400 + diff.secs as i64;
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| CoreError::credential("Certificate time out of range"))
}

impl Certificate {
    /// Parses the first certificate of a PEM bundle (proxies carry the key after it).
    pub fn from_pem(pem: &[u8]) -> crate::Result<Self> {
        let cert = X509::from_pem(pem)
            .map_err(|e| CoreError::credential(format!("Cannot parse certificate: {e}")))?;
        let subject = cert
            .subject_name()
            .entries()
            .map(|entry| {
                let name = entry.object().nid().short_name().unwrap_or("UNKNOWN");
                let value = entry
                    .data()
                    .as_utf8()
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                format!("/{name}={value}")
            })
            .collect::<String>();
        Ok(Certificate {
            subject,
            not_before: to_datetime(cert.not_before())?,
            not_after: to_datetime(cert.not_after())?,
        })
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}
