//! Handshake record exchanged before any chunk flows.
//!
//! # Format
//!
//! ```text
//! apiKey\n<key>\r\nfileName\n<name>\r\n ... \r\nfileSize\n<bytes>
//! ```
//!
//! One record per field, key and value separated by the first `\n`,
//! records separated by `\r\n`. An empty value means the field is absent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::DEFAULT_BLOCK_SIZE;

/// Separator between records.
pub const RECORD_DELIMITER: &str = "\r\n";

/// Separator between a record's key and its value.
pub const KEY_VALUE_DELIMITER: char = '\n';

pub const KEY_API_KEY: &str = "apiKey";
pub const KEY_FILE_NAME: &str = "fileName";
pub const KEY_DIRECTORY: &str = "directory";
pub const KEY_SAVEPOINT: &str = "savepoint";
pub const KEY_METADATA: &str = "metadata";
pub const KEY_COMMENT: &str = "comment";
pub const KEY_BLOCK_SIZE: &str = "blockSize";
pub const KEY_RESUME: &str = "resume";
pub const KEY_OVERWRITE: &str = "overwrite";
pub const KEY_FILE_SIZE: &str = "fileSize";

/// Errors produced while encoding or parsing a handshake record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("malformed record: {0:?}")]
    MalformedRecord(String),

    #[error("{0} is missing")]
    MissingField(&'static str),

    #[error("invalid {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("{0} contains the record delimiter")]
    DelimiterInValue(&'static str),
}

/// Logical upload request sent by the producer side.
///
/// Immutable once the handshake has been sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TransferRequest {
    pub api_key: String,
    pub file_name: String,
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub savepoint: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub file_size: Option<u64>,
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

impl TransferRequest {
    /// Creates a request with default options for `file_name`.
    pub fn new(api_key: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            file_name: file_name.into(),
            directory: None,
            savepoint: None,
            metadata: None,
            comment: None,
            block_size: DEFAULT_BLOCK_SIZE,
            resume: false,
            overwrite: false,
            file_size: None,
        }
    }

    /// Encodes the request as handshake text.
    pub fn encode(&self) -> Result<String, HandshakeError> {
        if self.block_size == 0 {
            return Err(HandshakeError::InvalidValue {
                field: KEY_BLOCK_SIZE,
                value: "0".into(),
            });
        }

        let block_size = self.block_size.to_string();
        let resume = self.resume.to_string();
        let overwrite = self.overwrite.to_string();
        let file_size = self.file_size.map(|s| s.to_string());

        let records: [(&'static str, Option<&str>); 10] = [
            (KEY_API_KEY, Some(self.api_key.as_str())),
            (KEY_FILE_NAME, Some(self.file_name.as_str())),
            (KEY_DIRECTORY, self.directory.as_deref()),
            (KEY_SAVEPOINT, self.savepoint.as_deref()),
            (KEY_METADATA, self.metadata.as_deref()),
            (KEY_COMMENT, self.comment.as_deref()),
            (KEY_BLOCK_SIZE, Some(block_size.as_str())),
            (KEY_RESUME, Some(resume.as_str())),
            (KEY_OVERWRITE, Some(overwrite.as_str())),
            (KEY_FILE_SIZE, file_size.as_deref()),
        ];

        let mut encoded = Vec::with_capacity(records.len());
        for (key, value) in records {
            let value = value.unwrap_or("");
            if value.contains(RECORD_DELIMITER) {
                return Err(HandshakeError::DelimiterInValue(key));
            }
            encoded.push(format!("{key}{KEY_VALUE_DELIMITER}{value}"));
        }
        Ok(encoded.join(RECORD_DELIMITER))
    }

    /// Parses handshake text into a request.
    ///
    /// `fileName` and `apiKey` are required. A missing `blockSize` falls
    /// back to [`DEFAULT_BLOCK_SIZE`].
    pub fn parse(text: &str) -> Result<Self, HandshakeError> {
        let mut records = parse_records(text)?;
        let mut take = |key: &str| records.remove(key).flatten();

        let api_key = take(KEY_API_KEY).ok_or(HandshakeError::MissingField(KEY_API_KEY))?;
        let file_name = take(KEY_FILE_NAME).ok_or(HandshakeError::MissingField(KEY_FILE_NAME))?;

        let block_size = match take(KEY_BLOCK_SIZE) {
            None => DEFAULT_BLOCK_SIZE,
            Some(v) => match v.parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(HandshakeError::InvalidValue {
                        field: KEY_BLOCK_SIZE,
                        value: v,
                    });
                }
            },
        };

        let file_size = match take(KEY_FILE_SIZE) {
            None => None,
            Some(v) => Some(v.parse::<u64>().map_err(|_| HandshakeError::InvalidValue {
                field: KEY_FILE_SIZE,
                value: v.clone(),
            })?),
        };

        Ok(Self {
            api_key,
            file_name,
            directory: take(KEY_DIRECTORY),
            savepoint: take(KEY_SAVEPOINT),
            metadata: take(KEY_METADATA),
            comment: take(KEY_COMMENT),
            block_size,
            resume: take(KEY_RESUME).is_some_and(|v| parse_flag(&v)),
            overwrite: take(KEY_OVERWRITE).is_some_and(|v| parse_flag(&v)),
            file_size,
        })
    }
}

/// Splits handshake text into a key -> value lookup.
///
/// Empty values map to `None`. Every record must contain a key/value
/// separator and a non-empty key.
pub fn parse_records(text: &str) -> Result<HashMap<String, Option<String>>, HandshakeError> {
    let mut map = HashMap::new();
    for record in text.split(RECORD_DELIMITER) {
        let Some((key, value)) = record.split_once(KEY_VALUE_DELIMITER) else {
            return Err(HandshakeError::MalformedRecord(record.to_string()));
        };
        if key.is_empty() {
            return Err(HandshakeError::MalformedRecord(record.to_string()));
        }
        let value = (!value.is_empty()).then(|| value.to_string());
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransferRequest {
        TransferRequest {
            api_key: "key-123".into(),
            file_name: "sensor.csv".into(),
            directory: Some("plant/line1".into()),
            savepoint: None,
            metadata: Some("site=pune".into()),
            comment: Some("nightly dump".into()),
            block_size: 1000,
            resume: true,
            overwrite: false,
            file_size: Some(2500),
        }
    }

    #[test]
    fn encode_then_parse_preserves_fields() {
        let req = sample();
        let text = req.encode().unwrap();
        assert_eq!(TransferRequest::parse(&text).unwrap(), req);
    }

    #[test]
    fn encoded_layout_matches_record_format() {
        let text = TransferRequest::new("k", "a.bin").encode().unwrap();
        assert!(text.starts_with("apiKey\nk\r\nfileName\na.bin\r\ndirectory\n\r\n"));
        assert!(text.ends_with("overwrite\nfalse\r\nfileSize\n"));
    }

    #[test]
    fn empty_value_is_absent() {
        let map = parse_records("fileName\nx\r\ndirectory\n").unwrap();
        assert_eq!(map["fileName"], Some("x".into()));
        assert_eq!(map["directory"], None);
    }

    #[test]
    fn record_without_separator_is_malformed() {
        let err = parse_records("fileName\nx\r\ngarbage").unwrap_err();
        assert_eq!(err, HandshakeError::MalformedRecord("garbage".into()));
    }

    #[test]
    fn empty_text_is_malformed() {
        assert!(matches!(
            TransferRequest::parse(""),
            Err(HandshakeError::MalformedRecord(_))
        ));
    }

    #[test]
    fn empty_key_is_malformed() {
        assert!(parse_records("\nvalue").is_err());
    }

    #[test]
    fn missing_file_name_rejected() {
        let err = TransferRequest::parse("apiKey\nk\r\nfileName\n").unwrap_err();
        assert_eq!(err, HandshakeError::MissingField(KEY_FILE_NAME));
    }

    #[test]
    fn missing_block_size_uses_default() {
        let req = TransferRequest::parse("apiKey\nk\r\nfileName\nf").unwrap();
        assert_eq!(req.block_size, DEFAULT_BLOCK_SIZE);
        assert!(!req.resume);
        assert!(!req.overwrite);
        assert_eq!(req.file_size, None);
    }

    #[test]
    fn zero_block_size_rejected() {
        let err = TransferRequest::parse("apiKey\nk\r\nfileName\nf\r\nblockSize\n0").unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidValue { field: KEY_BLOCK_SIZE, .. }));
    }

    #[test]
    fn non_numeric_file_size_rejected() {
        let err = TransferRequest::parse("apiKey\nk\r\nfileName\nf\r\nfileSize\nbig").unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidValue { field: KEY_FILE_SIZE, .. }));
    }

    #[test]
    fn flags_are_case_insensitive() {
        let req =
            TransferRequest::parse("apiKey\nk\r\nfileName\nf\r\nresume\nTRUE\r\noverwrite\nyes")
                .unwrap();
        assert!(req.resume);
        assert!(!req.overwrite);
    }

    #[test]
    fn unknown_keys_ignored() {
        let req = TransferRequest::parse("apiKey\nk\r\nfileName\nf\r\ncolour\nblue").unwrap();
        assert_eq!(req.file_name, "f");
    }

    #[test]
    fn value_with_delimiter_cannot_be_encoded() {
        let mut req = sample();
        req.comment = Some("line one\r\nline two".into());
        assert_eq!(
            req.encode().unwrap_err(),
            HandshakeError::DelimiterInValue(KEY_COMMENT)
        );
    }

    #[test]
    fn value_may_contain_newline() {
        let mut req = sample();
        req.metadata = Some("a=1\nb=2".into());
        let parsed = TransferRequest::parse(&req.encode().unwrap()).unwrap();
        assert_eq!(parsed.metadata.as_deref(), Some("a=1\nb=2"));
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let json = r#"{"api_key":"k","file_name":"f"}"#;
        let req: TransferRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req, TransferRequest::new("k", "f"));
    }
}
