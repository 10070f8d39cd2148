use std::fmt;

use chrono::{DateTime, Utc};
use diesel::{
    deserialize::{self, FromSql},
    pg::{Pg, PgValue},
    serialize::{self, Output, ToSql},
    sql_types::Text,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown {kind} value {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a fieldless enum persisted as `TEXT`, with the string form used
/// both in the database and in decoded-block JSON.
macro_rules! text_enum {
    (
        $(#[$attr:meta])*
        pub enum $name:ident {
            $($variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$attr])*
        #[derive(
            Clone,
            Copy,
            Debug,
            PartialEq,
            Eq,
            Hash,
            diesel::AsExpression,
            diesel::FromSqlRow,
            Serialize,
            Deserialize,
        )]
        #[diesel(sql_type = Text)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant
            ),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(input: &str) -> Result<$name, Self::Err> {
                match input {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl ToSql<Text, Pg> for $name {
            fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
                <str as ToSql<Text, Pg>>::to_sql(self.as_str(), &mut out.reborrow())
            }
        }

        impl FromSql<Text, Pg> for $name {
            fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
                let text = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
                Ok(text.parse()?)
            }
        }
    };
}

text_enum! {
    pub enum TxStatus {
        Success => "success",
        Revert => "revert",
    }
}

text_enum! {
    pub enum TraceKind {
        Call => "call",
        Create => "create",
        SelfDestruct => "selfdestruct",
        Reward => "reward",
    }
}

text_enum! {
    pub enum TransferKind {
        Mint => "mint",
        Burn => "burn",
        Transfer => "transfer",
    }
}

text_enum! {
    pub enum TokenKind {
        Erc20 => "erc20",
        Erc721 => "erc721",
        Erc1155 => "erc1155",
    }
}

text_enum! {
    pub enum ProxyKind {
        Eip1967 => "eip1967",
        Eip1822 => "eip1822",
        Eip1167 => "eip1167",
        Custom => "custom",
    }
}

/// Hex keys are compared case-insensitively everywhere; the lower-case form
/// is what gets stored.
pub fn normalize_hash(hash: &str) -> String {
    hash.trim().to_ascii_lowercase()
}

pub fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn millis_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_milliseconds().max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn text_enums_parse_their_own_output() {
        assert_eq!("revert".parse::<TxStatus>().unwrap(), TxStatus::Revert);
        assert_eq!(TransferKind::Mint.to_string(), "mint");
        let err = "erc777".parse::<TokenKind>().unwrap_err();
        assert_eq!(err.kind, "TokenKind");
    }

    #[test]
    fn text_enums_use_lowercase_json() {
        let kind: ProxyKind = serde_json::from_str("\"eip1967\"").unwrap();
        assert_eq!(kind, ProxyKind::Eip1967);
        assert_eq!(serde_json::to_string(&TxStatus::Success).unwrap(), "\"success\"");
    }

    #[test]
    fn hashes_are_lowercased() {
        assert_eq!(normalize_hash(" 0xABCdef "), "0xabcdef");
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(Some("0x60".into())), Some("0x60".into()));
    }

    #[test]
    fn block_time_never_goes_negative() {
        let a = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let b = Utc.timestamp_opt(1_700_000_012, 0).unwrap();
        assert_eq!(millis_between(a, b), 12_000);
        assert_eq!(millis_between(b, a), 0);
    }
}
