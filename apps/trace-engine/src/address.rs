use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const UNIT_DESIGNATORS: &[&str] = &["APT", "APARTMENT", "UNIT", "STE", "SUITE", "#"];

const STREET_ABBREVIATIONS: &[(&str, &str)] = &[
    ("ALLEY", "ALY"),
    ("AVENUE", "AVE"),
    ("AV", "AVE"),
    ("BOULEVARD", "BLVD"),
    ("CAUSEWAY", "CSWY"),
    ("CIRCLE", "CIR"),
    ("COURT", "CT"),
    ("COVE", "CV"),
    ("CROSSING", "XING"),
    ("DRIVE", "DR"),
    ("EXPRESSWAY", "EXPY"),
    ("FREEWAY", "FWY"),
    ("HIGHWAY", "HWY"),
    ("LANE", "LN"),
    ("PARKWAY", "PKWY"),
    ("PLACE", "PL"),
    ("PLAZA", "PLZ"),
    ("POINT", "PT"),
    ("ROAD", "RD"),
    ("SQUARE", "SQ"),
    ("STREET", "ST"),
    ("STR", "ST"),
    ("TERRACE", "TER"),
    ("TRAIL", "TRL"),
    ("NORTH", "N"),
    ("SOUTH", "S"),
    ("EAST", "E"),
    ("WEST", "W"),
    ("NORTHEAST", "NE"),
    ("NORTHWEST", "NW"),
    ("SOUTHEAST", "SE"),
    ("SOUTHWEST", "SW"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressField {
    Address,
    City,
    State,
    Zip,
}

impl AddressField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::City => "city",
            Self::State => "state",
            Self::Zip => "zip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {}: {message}", .field.as_str())]
pub struct ValidationError {
    pub field: AddressField,
    pub message: String,
}

impl ValidationError {
    fn new(field: AddressField, message: &str) -> Self {
        Self {
            field,
            message: message.to_string(),
        }
    }
}

/// Raw address fields exactly as the caller supplied them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInput {
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
}

/// Normalized address plus its fingerprint.
///
/// `canonical` is `ADDRESS|CITY|STATE|ZIP5`; `fingerprint` is the hex SHA-256 of
/// that string. Two spellings of the same property yield the same fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalAddress {
    pub street: String,
    pub city: String,
    pub state: String,
    pub zip5: String,
    pub canonical: String,
    pub fingerprint: String,
}

pub fn validate(input: &AddressInput) -> Result<(), ValidationError> {
    if input.address.trim().chars().count() < 3 {
        return Err(ValidationError::new(
            AddressField::Address,
            "must be at least 3 characters",
        ));
    }
    if input.city.trim().chars().count() < 2 {
        return Err(ValidationError::new(
            AddressField::City,
            "must be at least 2 characters",
        ));
    }
    let state = input.state.trim();
    if state.len() != 2 || !state.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ValidationError::new(
            AddressField::State,
            "must be a 2-letter state code",
        ));
    }
    if !is_valid_zip(input.zip.trim()) {
        return Err(ValidationError::new(
            AddressField::Zip,
            "must be 5 digits or ZIP+4 (12345-6789)",
        ));
    }
    Ok(())
}

fn is_valid_zip(zip: &str) -> bool {
    let all_digits = |value: &str| value.chars().all(|c| c.is_ascii_digit());
    match zip.split_once('-') {
        None => zip.len() == 5 && all_digits(zip),
        Some((head, tail)) => {
            head.len() == 5 && tail.len() == 4 && all_digits(head) && all_digits(tail)
        }
    }
}

pub fn canonicalize(input: &AddressInput) -> CanonicalAddress {
    let street = normalize_street(&input.address);
    let city = normalize_city(&input.city);
    let state = input.state.trim().to_ascii_uppercase();
    let zip5 = input
        .zip
        .chars()
        .filter(char::is_ascii_digit)
        .take(5)
        .collect::<String>();
    let canonical = format!("{street}|{city}|{state}|{zip5}");
    let fingerprint = hex::encode(Sha256::digest(canonical.as_bytes()));
    CanonicalAddress {
        street,
        city,
        state,
        zip5,
        canonical,
        fingerprint,
    }
}

/// Street line with unit designators removed and suffixes/directionals contracted.
pub fn normalize_street(raw: &str) -> String {
    let tokens = tokenize(raw);
    let mut out: Vec<&str> = Vec::with_capacity(tokens.len());
    let mut skip_next = false;
    for (index, token) in tokens.iter().enumerate() {
        if skip_next {
            skip_next = false;
            continue;
        }
        // The house number is never a unit designator.
        if index > 0 {
            if UNIT_DESIGNATORS.contains(&token.as_str()) {
                skip_next = true;
                continue;
            }
            if token.starts_with('#') {
                continue;
            }
        }
        out.push(abbreviate(token));
    }
    out.join(" ")
}

pub fn normalize_city(raw: &str) -> String {
    tokenize(raw)
        .into_iter()
        .filter(|token| token != "#")
        .collect::<Vec<_>>()
        .join(" ")
}

fn abbreviate(token: &str) -> &str {
    STREET_ABBREVIATIONS
        .iter()
        .find(|(long, _)| *long == token)
        .map_or(token, |(_, short)| *short)
}

fn tokenize(raw: &str) -> Vec<String> {
    let mut cleaned = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '.' | '\'' => {}
            '#' => {
                cleaned.push(' ');
                cleaned.push('#');
            }
            c if c.is_ascii_alphanumeric() => cleaned.push(c.to_ascii_uppercase()),
            _ => cleaned.push(' '),
        }
    }
    cleaned.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(address: &str, city: &str, state: &str, zip: &str) -> AddressInput {
        AddressInput {
            address: address.to_string(),
            city: city.to_string(),
            state: state.to_string(),
            zip: zip.to_string(),
        }
    }

    #[test]
    fn equivalent_spellings_share_a_fingerprint() {
        let spellings = [
            input("123 Main Street Apt 4B", "Austin", "TX", "78701"),
            input("123 MAIN ST", "AUSTIN", "tx", "78701-1234"),
            input("123 Main St., #4B", " austin ", "TX", "78701"),
            input("123  main   street  suite 200", "Austin", "TX", "78701"),
            input("123 Main St Unit 7", "Austin", "TX", "78701"),
        ];
        let expected = canonicalize(&spellings[0]);
        assert_eq!(expected.canonical, "123 MAIN ST|AUSTIN|TX|78701");
        for spelling in &spellings[1..] {
            assert_eq!(canonicalize(spelling).fingerprint, expected.fingerprint);
        }
    }

    #[test]
    fn directionals_and_suffixes_are_contracted() {
        let canonical = canonicalize(&input(
            "500 North Oak Boulevard",
            "St. Louis",
            "MO",
            "63101",
        ));
        assert_eq!(canonical.street, "500 N OAK BLVD");
        assert_eq!(canonical.city, "ST LOUIS");
        assert_eq!(canonical.fingerprint.len(), 64);
    }

    #[test]
    fn different_zip_changes_fingerprint() {
        let a = canonicalize(&input("123 Main St", "Austin", "TX", "78701"));
        let b = canonicalize(&input("123 Main St", "Austin", "TX", "78702"));
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn validation_names_the_offending_field() {
        let cases = [
            (input("12", "Austin", "TX", "78701"), AddressField::Address),
            (input("123 Main St", "A", "TX", "78701"), AddressField::City),
            (input("123 Main St", "Austin", "Tex", "78701"), AddressField::State),
            (input("123 Main St", "Austin", "T1", "78701"), AddressField::State),
            (input("123 Main St", "Austin", "TX", "7870"), AddressField::Zip),
            (input("123 Main St", "Austin", "TX", "78701-12"), AddressField::Zip),
            (input("123 Main St", "Austin", "TX", "7870a"), AddressField::Zip),
        ];
        for (case, field) in cases {
            let error = validate(&case).expect_err("validation should fail");
            assert_eq!(error.field, field, "case {case:?}");
        }
        assert!(validate(&input("123 Main St", "Austin", "TX", "78701-1234")).is_ok());
    }
}
