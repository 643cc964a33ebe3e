use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const PNI_PREFIX: &str = "PNI:";

/// Permanent account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Uuid", into = "Uuid")]
pub struct Aci(Uuid);

/// Phone-number identity. Permanent, but not yet (or not necessarily) tied to an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Uuid", into = "Uuid")]
pub struct Pni(Uuid);

macro_rules! service_id {
    ($name:ident, $label:literal) => {
        impl $name {
            pub fn new(uuid: Uuid) -> Result<Self> {
                if uuid.is_nil() {
                    return Err(Error::InvalidIdentifier(format!("unknown {}", $label)));
                }
                Ok(Self(uuid))
            }

            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl TryFrom<Uuid> for $name {
            type Error = Error;

            fn try_from(uuid: Uuid) -> Result<Self> {
                Self::new(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Uuid {
                id.0
            }
        }
    };
}

service_id!(Aci, "ACI");
service_id!(Pni, "PNI");

impl fmt::Display for Aci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Display for Pni {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PNI_PREFIX, self.0.hyphenated())
    }
}

impl FromStr for Aci {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(Uuid::parse_str(s)?)
    }
}

impl FromStr for Pni {
    type Err = Error;

    /// Accepts both the prefixed (`PNI:<uuid>`) and the bare form.
    fn from_str(s: &str) -> Result<Self> {
        let raw = s.strip_prefix(PNI_PREFIX).unwrap_or(s);
        Self::new(Uuid::parse_str(raw)?)
    }
}

/// Identifier kinds ordered by how strongly they prove identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Username,
    Number,
    Pni,
    Aci,
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdentifierKind::Username => "username",
            IdentifierKind::Number => "number",
            IdentifierKind::Pni => "pni",
            IdentifierKind::Aci => "aci",
        };
        f.write_str(name)
    }
}

/// Every identifier known for one peer. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRecipientAddress")]
pub struct RecipientAddress {
    #[serde(skip_serializing_if = "Option::is_none")]
    aci: Option<Aci>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pni: Option<Pni>,
    #[serde(skip_serializing_if = "Option::is_none")]
    number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
}

#[derive(Deserialize)]
struct RawRecipientAddress {
    #[serde(default)]
    aci: Option<Aci>,
    #[serde(default)]
    pni: Option<Pni>,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl TryFrom<RawRecipientAddress> for RecipientAddress {
    type Error = Error;

    fn try_from(raw: RawRecipientAddress) -> Result<Self> {
        RecipientAddress::new(raw.aci, raw.pni, raw.number, raw.username)
    }
}

fn validate_number(number: String) -> Result<String> {
    let valid = number.len() > 1
        && number.starts_with('+')
        && !number.chars().any(char::is_whitespace);
    if !valid {
        return Err(Error::InvalidIdentifier(format!(
            "phone number must be in +E.164 form: {:?}",
            number
        )));
    }
    Ok(number)
}

fn validate_username(username: String) -> Result<String> {
    if username.trim().is_empty() {
        return Err(Error::InvalidIdentifier("empty username".to_string()));
    }
    Ok(username)
}

impl RecipientAddress {
    pub fn new(
        aci: Option<Aci>,
        pni: Option<Pni>,
        number: Option<String>,
        username: Option<String>,
    ) -> Result<Self> {
        if aci.is_none() && pni.is_none() && number.is_none() && username.is_none() {
            return Err(Error::EmptyAddress);
        }
        Ok(Self {
            aci,
            pni,
            number: number.map(validate_number).transpose()?,
            username: username.map(validate_username).transpose()?,
        })
    }

    pub fn from_aci(aci: Aci) -> Self {
        Self {
            aci: Some(aci),
            pni: None,
            number: None,
            username: None,
        }
    }

    pub fn from_pni(pni: Pni) -> Self {
        Self {
            aci: None,
            pni: Some(pni),
            number: None,
            username: None,
        }
    }

    pub fn from_number(number: impl Into<String>) -> Result<Self> {
        Self::new(None, None, Some(number.into()), None)
    }

    pub fn from_username(username: impl Into<String>) -> Result<Self> {
        Self::new(None, None, None, Some(username.into()))
    }

    pub fn with_aci(mut self, aci: Aci) -> Self {
        self.aci = Some(aci);
        self
    }

    pub fn with_pni(mut self, pni: Pni) -> Self {
        self.pni = Some(pni);
        self
    }

    pub fn with_number(mut self, number: impl Into<String>) -> Result<Self> {
        self.number = Some(validate_number(number.into())?);
        Ok(self)
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Result<Self> {
        self.username = Some(validate_username(username.into())?);
        Ok(self)
    }

    pub fn aci(&self) -> Option<Aci> {
        self.aci
    }

    pub fn pni(&self) -> Option<Pni> {
        self.pni
    }

    pub fn number(&self) -> Option<&str> {
        self.number.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Best identifier for display and logging, strongest first.
    pub fn identifier(&self) -> String {
        if let Some(aci) = self.aci {
            aci.to_string()
        } else if let Some(pni) = self.pni {
            pni.to_string()
        } else if let Some(number) = &self.number {
            number.clone()
        } else {
            // constructors guarantee at least one field
            self.username.clone().unwrap_or_default()
        }
    }

    /// True if at least one identifier is present on both sides with the same value.
    pub fn matches(&self, other: &RecipientAddress) -> bool {
        self.rank(other).is_some()
    }

    /// The strongest identifier kind on which both addresses agree.
    pub fn rank(&self, other: &RecipientAddress) -> Option<IdentifierKind> {
        fn same<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            matches!((a, b), (Some(a), Some(b)) if a == b)
        }

        if same(&self.aci, &other.aci) {
            Some(IdentifierKind::Aci)
        } else if same(&self.pni, &other.pni) {
            Some(IdentifierKind::Pni)
        } else if same(&self.number, &other.number) {
            Some(IdentifierKind::Number)
        } else if same(&self.username, &other.username) {
            Some(IdentifierKind::Username)
        } else {
            None
        }
    }

    /// True if every identifier present in `other` is present here with the same value.
    pub fn has_identifiers_of(&self, other: &RecipientAddress) -> bool {
        fn covers<T: PartialEq>(mine: &Option<T>, theirs: &Option<T>) -> bool {
            theirs.is_none() || mine == theirs
        }

        covers(&self.aci, &other.aci)
            && covers(&self.pni, &other.pni)
            && covers(&self.number, &other.number)
            && covers(&self.username, &other.username)
    }

    /// True if this address carries an identifier that `other` does not carry with the same value.
    pub fn has_additional_identifiers_than(&self, other: &RecipientAddress) -> bool {
        !other.has_identifiers_of(self)
    }

    /// Field-wise union; values from `other` win where both are set.
    pub fn with_identifiers_from(&self, other: &RecipientAddress) -> RecipientAddress {
        RecipientAddress {
            aci: other.aci.or(self.aci),
            pni: other.pni.or(self.pni),
            number: other.number.clone().or_else(|| self.number.clone()),
            username: other.username.clone().or_else(|| self.username.clone()),
        }
    }

    /// Drops every identifier this address shares with `other`.
    ///
    /// Returns `None` if nothing would remain.
    pub fn without_identifiers_from(&self, other: &RecipientAddress) -> Option<RecipientAddress> {
        fn keep<T: PartialEq + Clone>(mine: &Option<T>, theirs: &Option<T>) -> Option<T> {
            match (mine, theirs) {
                (Some(a), Some(b)) if a == b => None,
                _ => mine.clone(),
            }
        }

        let stripped = RecipientAddress {
            aci: keep(&self.aci, &other.aci),
            pni: keep(&self.pni, &other.pni),
            number: keep(&self.number, &other.number),
            username: keep(&self.username, &other.username),
        };

        if stripped.aci.is_none()
            && stripped.pni.is_none()
            && stripped.number.is_none()
            && stripped.username.is_none()
        {
            None
        } else {
            Some(stripped)
        }
    }

    /// True if both carry an ACI and the two differ.
    pub fn has_conflicting_aci(&self, aci: Option<Aci>) -> bool {
        matches!((self.aci, aci), (Some(mine), Some(theirs)) if mine != theirs)
    }
}

impl fmt::Display for RecipientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(4);
        if let Some(aci) = self.aci {
            parts.push(format!("aci={}", aci));
        }
        if let Some(pni) = self.pni {
            parts.push(format!("pni={}", pni));
        }
        if let Some(number) = &self.number {
            parts.push(format!("number={}", number));
        }
        if let Some(username) = &self.username {
            parts.push(format!("username={}", username));
        }
        write!(f, "{{{}}}", parts.join(", "))
    }
}
