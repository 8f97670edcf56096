use serde_json::Value;

use crate::address::{normalize_city, normalize_street};
use crate::provider::types::{
    BatchRecord, ContactResult, MailingAddress, PhoneKind, PhoneNumber, ProviderRow,
};

pub const MAX_PHONES: usize = 8;
pub const MAX_EMAILS: usize = 5;
const NUMBERED_SLOTS: usize = 5;

/// Values the provider uses to mean "no data".
const SENTINELS: &[&str] = &["", "N/A", "NA", "NULL", "NONE", "-"];

const PADDING_ADDRESS: &str = "1 PADDING ROW";
const PADDING_CITY: &str = "PADDING";
const PADDING_STATE: &str = "ZZ";

/// Synthetic record appended to undersized batches.
pub fn padding_record() -> BatchRecord {
    BatchRecord {
        address: PADDING_ADDRESS.to_string(),
        city: PADDING_CITY.to_string(),
        state: PADDING_STATE.to_string(),
        first_name: None,
        last_name: None,
    }
}

impl ProviderRow {
    /// Text value for `key`, with sentinels and blanks mapped to `None`.
    pub fn text(&self, key: &str) -> Option<String> {
        let value = match self.0.get(key)? {
            Value::String(value) => value.trim().to_string(),
            Value::Number(value) => value.to_string(),
            _ => return None,
        };
        if SENTINELS
            .iter()
            .any(|sentinel| value.eq_ignore_ascii_case(sentinel))
        {
            return None;
        }
        Some(value)
    }

    pub fn address_text(&self) -> Option<String> {
        self.text("address").or_else(|| self.text("property_address"))
    }

    pub fn city_text(&self) -> Option<String> {
        self.text("city").or_else(|| self.text("property_city"))
    }

    pub fn state_text(&self) -> Option<String> {
        self.text("state").or_else(|| self.text("property_state"))
    }

    /// Normalized `(street, city, state)` key used to pair rows with open records.
    pub fn match_key(&self) -> Option<(String, String, String)> {
        Some(match_key(
            &self.address_text()?,
            &self.city_text().unwrap_or_default(),
            &self.state_text().unwrap_or_default(),
        ))
    }

    pub fn is_padding(&self) -> bool {
        self.address_text()
            .is_some_and(|address| normalize_street(&address) == PADDING_ADDRESS)
            && self
                .state_text()
                .is_none_or(|state| state.eq_ignore_ascii_case(PADDING_STATE))
    }

    pub fn has_contact_fields(&self) -> bool {
        parse_result(self).has_contact()
    }
}

pub fn match_key(address: &str, city: &str, state: &str) -> (String, String, String) {
    (
        normalize_street(address),
        normalize_city(city),
        state.trim().to_ascii_uppercase(),
    )
}

pub fn parse_result(row: &ProviderRow) -> ContactResult {
    let mut phones: Vec<PhoneNumber> = Vec::new();
    let mut push_phone = |raw: Option<String>, kind: PhoneKind| {
        let Some(number) = raw.as_deref().and_then(normalize_phone) else {
            return;
        };
        if phones.len() < MAX_PHONES && !phones.iter().any(|phone| phone.number == number) {
            phones.push(PhoneNumber { number, kind });
        }
    };
    push_phone(row.text("phone"), PhoneKind::Primary);
    for slot in 1..=NUMBERED_SLOTS {
        push_phone(row.text(&format!("mobile_{slot}")), PhoneKind::Mobile);
    }
    for slot in 1..=NUMBERED_SLOTS {
        push_phone(row.text(&format!("landline_{slot}")), PhoneKind::Landline);
    }

    let mut emails: Vec<String> = Vec::new();
    let email_keys = std::iter::once("email".to_string())
        .chain((1..=NUMBERED_SLOTS).map(|slot| format!("email_{slot}")));
    for key in email_keys {
        let Some(email) = row.text(&key).map(|email| email.to_ascii_lowercase()) else {
            continue;
        };
        if !email.contains('@') || emails.contains(&email) {
            continue;
        }
        if emails.len() == MAX_EMAILS {
            break;
        }
        emails.push(email);
    }

    let owner_names = [("first_name", "last_name"), ("owner2_first_name", "owner2_last_name")]
        .into_iter()
        .filter_map(|(first, last)| {
            let name = [row.text(first), row.text(last)]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" ");
            (!name.is_empty()).then_some(name)
        })
        .collect();

    let mailing_address = MailingAddress {
        address: row.text("mail_address"),
        city: row.text("mail_city"),
        state: row.text("mail_state"),
        zip: row.text("mail_zip"),
    };
    let mailing_address = (mailing_address != MailingAddress::default()).then_some(mailing_address);

    let confidence = confidence(phones.len(), emails.len());
    ContactResult {
        owner_names,
        phones,
        emails,
        mailing_address,
        confidence,
    }
}

/// Coarse score: zero without any channel, otherwise 50 plus channel bonuses.
fn confidence(phones: usize, emails: usize) -> u8 {
    if phones == 0 && emails == 0 {
        return 0;
    }
    let score = 50 + 10 * phones.min(3) + 10 * emails.min(2);
    score.min(100) as u8
}

fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let digits = match digits.len() {
        11 if digits.starts_with('1') => digits[1..].to_string(),
        10 => digits,
        _ => return None,
    };
    Some(digits)
}
