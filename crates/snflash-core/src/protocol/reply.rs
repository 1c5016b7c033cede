//! Text reply parsing.

use super::ProtocolError;
use super::constants::{REPLY_ERR, REPLY_MODEL, REPLY_OK, REPLY_SERIAL};

/// A line-terminated reply from the device, terminator already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextReply {
    /// `MODEL <id>`
    Model(String),
    /// `SN <value>`; the value is not validated here.
    Serial(String),
    /// `OK`
    Ok,
    /// `ERR <message>`
    Err(String),
}

impl TextReply {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (head, rest) = match line.split_once(' ') {
            Some((h, r)) => (h, r.trim()),
            None => (line, ""),
        };

        match head {
            REPLY_OK if rest.is_empty() => Ok(TextReply::Ok),
            REPLY_ERR => Ok(TextReply::Err(rest.to_string())),
            REPLY_MODEL if is_model_token(rest) => Ok(TextReply::Model(rest.to_string())),
            REPLY_SERIAL if !rest.is_empty() => Ok(TextReply::Serial(rest.to_string())),
            _ => Err(ProtocolError::UnexpectedFrame(format!(
                "unrecognized reply {:?}",
                line
            ))),
        }
    }
}

fn is_model_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, ',' | '-' | '_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_replies() {
        assert_eq!(
            TextReply::parse("MODEL J680AP\r\n").unwrap(),
            TextReply::Model("J680AP".into())
        );
        assert_eq!(
            TextReply::parse("SN C02123ABCQ6L").unwrap(),
            TextReply::Serial("C02123ABCQ6L".into())
        );
        assert_eq!(TextReply::parse("OK").unwrap(), TextReply::Ok);
        assert_eq!(
            TextReply::parse("ERR locked").unwrap(),
            TextReply::Err("locked".into())
        );
        assert_eq!(TextReply::parse("ERR").unwrap(), TextReply::Err(String::new()));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(TextReply::parse("").is_err());
        assert!(TextReply::parse("MODEL").is_err());
        assert!(TextReply::parse("MODEL ??").is_err());
        assert!(TextReply::parse("SN").is_err());
        assert!(TextReply::parse("OK extra").is_err());
        assert!(TextReply::parse("\u{fffd}\u{fffd}").is_err());
    }
}
