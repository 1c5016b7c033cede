//! Serial number codec.
//!
//! A serial is a fixed-width, 12-character uppercase string made of five
//! packed fields:
//!
//! | index | field    | width | alphabet     |
//! |-------|----------|-------|--------------|
//! | 0     | location | 3     | A-Z 0-9      |
//! | 1     | year     | 1     | 0-9          |
//! | 2     | week     | 2     | 0-9          |
//! | 3     | unit     | 3     | A-Z 0-9      |
//! | 4     | config   | 3     | A-Z 0-9      |

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use thiserror::Error;

/// Total width of a serial number.
pub const SERIAL_LEN: usize = 12;

/// Characters drawn when generating a unit identifier. `I` and `O` are left
/// out so a printed label cannot be misread as `1`/`0`.
const UNIT_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ0123456789";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Serial must be {expected} characters, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Invalid character {ch:?} at position {position} in field {field_index} ({field})")]
    InvalidCharacterInField {
        field_index: usize,
        field: SerialField,
        position: usize,
        ch: char,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alphabet {
    Numeric,
    Alphanumeric,
}

impl Alphabet {
    fn allows(self, c: char) -> bool {
        match self {
            Alphabet::Numeric => c.is_ascii_digit(),
            Alphabet::Alphanumeric => c.is_ascii_digit() || c.is_ascii_uppercase(),
        }
    }
}

/// Sub-fields packed into a serial number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialField {
    Location,
    Year,
    Week,
    Unit,
    Config,
}

impl SerialField {
    pub const ALL: [SerialField; 5] = [
        SerialField::Location,
        SerialField::Year,
        SerialField::Week,
        SerialField::Unit,
        SerialField::Config,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn width(self) -> usize {
        match self {
            SerialField::Location => 3,
            SerialField::Year => 1,
            SerialField::Week => 2,
            SerialField::Unit => 3,
            SerialField::Config => 3,
        }
    }

    /// Byte offset of this field in the packed string.
    pub fn offset(self) -> usize {
        Self::ALL[..self.index()].iter().map(|f| f.width()).sum()
    }

    fn alphabet(self) -> Alphabet {
        match self {
            SerialField::Year | SerialField::Week => Alphabet::Numeric,
            _ => Alphabet::Alphanumeric,
        }
    }
}

impl fmt::Display for SerialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialField::Location => write!(f, "location"),
            SerialField::Year => write!(f, "year"),
            SerialField::Week => write!(f, "week"),
            SerialField::Unit => write!(f, "unit"),
            SerialField::Config => write!(f, "config"),
        }
    }
}

/// A validated serial number. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SerialNumber(String);

impl SerialNumber {
    /// Get one sub-field.
    pub fn field(&self, field: SerialField) -> &str {
        let start = field.offset();
        &self.0[start..start + field.width()]
    }

    pub fn location(&self) -> &str {
        self.field(SerialField::Location)
    }

    pub fn year(&self) -> &str {
        self.field(SerialField::Year)
    }

    pub fn week(&self) -> &str {
        self.field(SerialField::Week)
    }

    pub fn unit(&self) -> &str {
        self.field(SerialField::Unit)
    }

    pub fn config(&self) -> &str {
        self.field(SerialField::Config)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SerialNumber {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Strip everything but ASCII letters and digits, then uppercase.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Parse a candidate exactly as given. No sanitizing is applied.
pub fn parse(candidate: &str) -> Result<SerialNumber, ValidationError> {
    let chars: Vec<char> = candidate.chars().collect();
    if chars.len() != SERIAL_LEN {
        return Err(ValidationError::LengthMismatch {
            expected: SERIAL_LEN,
            actual: chars.len(),
        });
    }

    for field in SerialField::ALL {
        let start = field.offset();
        for (i, &ch) in chars[start..start + field.width()].iter().enumerate() {
            if !field.alphabet().allows(ch) {
                return Err(ValidationError::InvalidCharacterInField {
                    field_index: field.index(),
                    field,
                    position: start + i,
                    ch,
                });
            }
        }
    }

    Ok(SerialNumber(chars.into_iter().collect()))
}

pub fn validate(candidate: &str) -> bool {
    parse(candidate).is_ok()
}

/// Canonical display string; lossless.
pub fn format(serial: &SerialNumber) -> String {
    serial.0.clone()
}

/// Rules for generating a replacement serial.
#[derive(Debug, Clone, Copy)]
pub struct GeneratePolicy {
    /// Never hand back the unit identifier of `existing`.
    pub require_distinct: bool,
}

impl Default for GeneratePolicy {
    fn default() -> Self {
        Self {
            require_distinct: true,
        }
    }
}

/// Build a replacement serial that keeps every manufacturing field of
/// `existing` and randomizes only the unit identifier.
pub fn generate<R: Rng + ?Sized>(
    existing: &SerialNumber,
    policy: GeneratePolicy,
    rng: &mut R,
) -> SerialNumber {
    let unit_offset = SerialField::Unit.offset();
    let unit_width = SerialField::Unit.width();
    loop {
        let unit: String = (0..unit_width)
            .map(|_| UNIT_ALPHABET[rng.gen_range(0..UNIT_ALPHABET.len())] as char)
            .collect();
        if policy.require_distinct && unit == existing.unit() {
            continue;
        }
        let mut packed = String::with_capacity(SERIAL_LEN);
        packed.push_str(&existing.0[..unit_offset]);
        packed.push_str(&unit);
        packed.push_str(&existing.0[unit_offset + unit_width..]);
        return SerialNumber(packed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_layout_widths() {
        let total: usize = SerialField::ALL.iter().map(|f| f.width()).sum();
        assert_eq!(total, SERIAL_LEN);
        assert_eq!(SerialField::Unit.offset(), 6);
        assert_eq!(SerialField::Config.offset(), 9);
    }

    #[test]
    fn test_parse_fields() {
        let sn = parse("C02123ABCQ6L").unwrap();
        assert_eq!(sn.location(), "C02");
        assert_eq!(sn.year(), "1");
        assert_eq!(sn.week(), "23");
        assert_eq!(sn.unit(), "ABC");
        assert_eq!(sn.config(), "Q6L");
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("C02-ABCD1234XZ"), "C02ABCD1234XZ");
        assert_eq!(sanitize(" c02 123\tabc-q6l\n"), "C02123ABCQ6L");
        assert_eq!(sanitize("é-ß"), "");
    }

    #[test]
    fn test_dashed_lowercase_candidate_rejected() {
        let cleaned = sanitize("C02-ABCD1234XZ");
        assert_eq!(cleaned, "C02ABCD1234XZ");
        assert!(!validate(&cleaned));
        assert_eq!(
            parse(&cleaned),
            Err(ValidationError::LengthMismatch {
                expected: SERIAL_LEN,
                actual: 13
            })
        );
    }

    #[test]
    fn test_invalid_character_reports_field() {
        match parse("C02X23ABCQ6L") {
            Err(ValidationError::InvalidCharacterInField {
                field_index,
                field,
                position,
                ch,
            }) => {
                assert_eq!(field_index, 1);
                assert_eq!(field, SerialField::Year);
                assert_eq!(position, 3);
                assert_eq!(ch, 'X');
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(matches!(
            parse("C02123abcQ6L"),
            Err(ValidationError::InvalidCharacterInField { field_index: 3, .. })
        ));
        assert!(matches!(
            parse("C02123ABC Q6"),
            Err(ValidationError::InvalidCharacterInField { field_index: 4, .. })
        ));
    }

    #[test]
    fn test_format_is_lossless() {
        for s in ["C02123ABCQ6L", "F5K0019Z9ZZZ", "000000000000"] {
            let sn = parse(s).unwrap();
            assert_eq!(format(&sn), s);
            assert!(validate(&format(&sn)));
            assert_eq!(sn.to_string(), s);
        }
    }

    #[test]
    fn test_generate_preserves_metadata() {
        let existing = parse("C02123ABCQ6L").unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let fresh = generate(&existing, GeneratePolicy::default(), &mut rng);
            assert!(validate(fresh.as_str()));
            assert_eq!(fresh.location(), existing.location());
            assert_eq!(fresh.year(), existing.year());
            assert_eq!(fresh.week(), existing.week());
            assert_eq!(fresh.config(), existing.config());
            assert_ne!(fresh.unit(), existing.unit());
        }
    }

    #[test]
    fn test_from_str() {
        let sn: SerialNumber = "C02123ABCQ6L".parse().unwrap();
        assert_eq!(sn.as_str(), "C02123ABCQ6L");
        assert!("short".parse::<SerialNumber>().is_err());
    }
}
