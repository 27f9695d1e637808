use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::domain::company::CompanyId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TeamMemberId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub id: TeamMemberId,
    pub company_id: CompanyId,
    pub name: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Tool credential for one company. The secret is never printed by `Debug`.
#[derive(Clone, Debug)]
pub struct Credential {
    pub company_id: CompanyId,
    pub tool: String,
    pub secret: SecretString,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use secrecy::SecretString;

    use super::*;

    #[test]
    fn debug_output_redacts_secret() {
        let credential = Credential {
            company_id: CompanyId("co-1".to_string()),
            tool: "hubspot".to_string(),
            secret: SecretString::from("pat-na1-very-secret".to_string()),
            expires_at: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
            updated_at: Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap(),
        };

        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("very-secret"));
        assert!(credential.is_expired(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
    }
}
