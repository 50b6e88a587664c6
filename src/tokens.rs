//! # Token Resolution
//!
//! Builds the flat token map a template is rendered with. Every token is a
//! `{{name}}` placeholder mapped to a resolved string:
//!
//! - Built-in tokens come from entity fields, settings, and computed values
//!   (dates, QR code, version).
//! - Custom tokens come from the operator-defined mapping table.
//! - Caller overrides (customer name, order date) are applied last.
//!
//! All resolved text is sanitized: tags stripped, special characters
//! escaped, whitespace trimmed. The only exception is `{{qr_svg}}`, which
//! carries trusted pre-rendered markup.
//!
//! Resolution fails soft: a missing entity or one of the wrong kind yields
//! an empty map, and callers abort before rendering.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::entity::{EntityStore, META_CUSTOMER, META_ORDER_DATE};
use crate::error::LibritoError;
use crate::qr::QrClient;
use crate::settings::{Mapping, Settings};

/// Resolved token map, keyed by the full `{{name}}` form.
pub type TokenMap = BTreeMap<String, String>;

/// Serial code token key.
pub const TOKEN_SERIAL_CODE: &str = "{{serial_code}}";
/// Customer name token key (override-driven).
pub const TOKEN_CUSTOMER_NAME: &str = "{{customer_name}}";
/// Order date token key (override-driven, short date form).
pub const TOKEN_ORDER_DATE: &str = "{{order_date}}";

/// Resolves an entity into the token map its manual is rendered from.
pub struct TokenResolver {
    entities: Arc<dyn EntityStore>,
    settings: Arc<Settings>,
    mappings: Arc<Vec<Mapping>>,
    qr: Arc<QrClient>,
}

impl TokenResolver {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        settings: Arc<Settings>,
        mappings: Arc<Vec<Mapping>>,
        qr: Arc<QrClient>,
    ) -> Self {
        TokenResolver {
            entities,
            settings,
            mappings,
            qr,
        }
    }

    /// Resolve all tokens for an entity.
    ///
    /// Returns an empty map when the entity does not exist or is not a
    /// serialnumber record; callers must treat that as "do not render".
    /// Overrides are normalized to the `{{name}}` key form and applied
    /// last, with order-date values coerced to the short date format.
    pub async fn resolve(
        &self,
        entity_id: u64,
        overrides: &BTreeMap<String, String>,
    ) -> Result<TokenMap, LibritoError> {
        let mut tokens = TokenMap::new();

        let Some(entity) = self.entities.get(entity_id)? else {
            return Ok(tokens);
        };
        if !entity.is_serial() {
            return Ok(tokens);
        }

        // The URL encodes the raw serial; HTML escaping applies to the
        // token text only
        let raw_serial = entity.serial_code().trim();
        let serial = sanitize_text(raw_serial);
        let qr_url = format!(
            "{}/{}",
            self.settings.qr_base_url.trim_end_matches('/'),
            percent_encode(raw_serial)
        );

        // An empty transaction_date field yields empty date tokens;
        // format_* pass "" through unchanged
        let transaction_field = sanitize_text(entity.field("transaction_date"));
        let transaction_date = format_long(&transaction_field);

        let product_name = {
            let name = entity.field("product_name");
            let name = if name.trim().is_empty() {
                entity.title.as_str()
            } else {
                name
            };
            title_case(&sanitize_text(name))
        };

        let order_date = {
            let stored = entity.meta(META_ORDER_DATE);
            if stored.trim().is_empty() {
                format_short(&transaction_field)
            } else {
                sanitize_text(stored)
            }
        };

        tokens.insert("{{transaction_date}}".to_string(), transaction_date);
        tokens.insert("{{product_name}}".to_string(), product_name);
        tokens.insert(
            "{{material}}".to_string(),
            sanitize_text(entity.field("material")),
        );
        tokens.insert(
            "{{leather_type}}".to_string(),
            sanitize_text(entity.field("leather_type")),
        );
        tokens.insert("{{color}}".to_string(), sanitize_text(entity.field("color")));
        tokens.insert("{{size}}".to_string(), sanitize_text(entity.field("size")));
        tokens.insert(TOKEN_SERIAL_CODE.to_string(), serial);
        tokens.insert("{{qr_url}}".to_string(), qr_url.clone());
        tokens.insert(
            "{{brand_slogan}}".to_string(),
            sanitize_text(&self.settings.brand_slogan),
        );
        tokens.insert(
            "{{footer_phone}}".to_string(),
            sanitize_text(&self.settings.footer_phone),
        );
        tokens.insert("{{logo}}".to_string(), sanitize_text(&self.settings.logo_url));
        tokens.insert("{{generated_at}}".to_string(), format_long_utc(&Utc::now()));
        tokens.insert(
            "{{version}}".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        tokens.insert(
            TOKEN_CUSTOMER_NAME.to_string(),
            sanitize_text(entity.meta(META_CUSTOMER)),
        );
        tokens.insert(TOKEN_ORDER_DATE.to_string(), order_date);

        // Trusted pre-rendered markup; everything else above is escaped text
        tokens.insert(
            "{{qr_svg}}".to_string(),
            self.qr.generate_svg(&qr_url).await,
        );

        // Custom mappings: seed gaps, take non-empty field values, then
        // fall back to the static default when still empty
        for mapping in self.mappings.iter() {
            let key = brace(&mapping.token);
            if key == "{{}}" {
                continue;
            }
            tokens.entry(key.clone()).or_default();
            let value = entity.field(&mapping.source);
            if !value.trim().is_empty() {
                tokens.insert(key.clone(), sanitize_text(value));
            }
            if tokens.get(&key).is_some_and(|v| v.is_empty()) && !mapping.fallback.is_empty() {
                tokens.insert(key, sanitize_text(&mapping.fallback));
            }
        }

        // Caller overrides win last
        for (raw_key, raw_value) in overrides {
            let key = brace(raw_key);
            if key == "{{}}" {
                continue;
            }
            let value = if key == TOKEN_ORDER_DATE {
                format_short(&sanitize_text(raw_value))
            } else {
                sanitize_text(raw_value)
            };
            tokens.insert(key, value);
        }

        Ok(tokens)
    }
}

// ============================================================================
// TEXT HELPERS
// ============================================================================

/// Strip tags, escape special characters, and trim.
///
/// No raw markup from entity data survives this; the result is safe to
/// substitute into template HTML without further escaping.
pub fn sanitize_text(s: &str) -> String {
    escape_html(&strip_tags(s)).trim().to_string()
}

/// Escape HTML special characters.
pub(crate) fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            _ => out.push(c),
        }
    }
    out
}

/// Remove `<...>` tag spans. An unterminated tag drops the rest of the text.
fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '<' {
            for t in chars.by_ref() {
                if t == '>' {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Lowercase, then uppercase the first character of each word.
pub(crate) fn title_case(s: &str) -> String {
    let lower = s.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut at_word_start = true;
    for c in lower.chars() {
        if c.is_whitespace() {
            at_word_start = true;
            out.push(c);
        } else if at_word_start {
            out.extend(c.to_uppercase());
            at_word_start = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Percent-encode everything outside the URL-unreserved set.
pub(crate) fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Normalize a token name to its canonical `{{name}}` key form.
pub(crate) fn brace(token: &str) -> String {
    format!(
        "{{{{{}}}}}",
        token.trim_matches(|c: char| c == '{' || c == '}' || c.is_whitespace())
    )
}

// ============================================================================
// DATE HELPERS
// ============================================================================

/// Parse a date out of the accepted input shapes.
///
/// Accepted: RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD`, `DD/MM/YY`,
/// `DD/MM/YYYY`. Returns `None` for anything else.
pub fn parse_flexible(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.date());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    // Two-digit years first so "01/03/24" does not parse as year 24
    if let Ok(d) = NaiveDate::parse_from_str(s, "%d/%m/%y") {
        return Some(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%d/%m/%Y") {
        return Some(d);
    }
    None
}

/// Long display form ("05 March 2024"). Unparseable input passes verbatim.
pub fn format_long(s: &str) -> String {
    match parse_flexible(s) {
        Some(date) => date.format("%d %B %Y").to_string(),
        None => s.to_string(),
    }
}

/// Long display form of a UTC timestamp.
pub fn format_long_utc(dt: &DateTime<Utc>) -> String {
    dt.format("%d %B %Y").to_string()
}

/// Short form ("01/03/24"). Unparseable input passes verbatim.
pub fn format_short(s: &str) -> String {
    match parse_flexible(s) {
        Some(date) => date.format("%d/%m/%y").to_string(),
        None => s.to_string(),
    }
}

/// Short form of a UTC timestamp.
pub fn format_short_utc(dt: &DateTime<Utc>) -> String {
    dt.format("%d/%m/%y").to_string()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, JsonEntityStore, META_ORDER_DATE};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    // ========== Text Helper Tests ==========

    #[test]
    fn test_sanitize_strips_tags_and_escapes() {
        assert_eq!(sanitize_text("<b>Hand</b> & Hide"), "Hand &amp; Hide");
        assert_eq!(sanitize_text("  plain  "), "plain");
        assert_eq!(
            sanitize_text(r#"<img src="x" onerror="alert(1)">Tan"#),
            "Tan"
        );
    }

    #[test]
    fn test_sanitize_unterminated_tag_drops_rest() {
        assert_eq!(sanitize_text("before <script everything after"), "before");
    }

    #[test]
    fn test_escape_html_specials() {
        assert_eq!(
            escape_html(r#"<a href="x">'&'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;&#039;&amp;&#039;&lt;/a&gt;"
        );
    }

    #[test]
    fn test_title_case() {
        assert_eq!(title_case("classic BIFOLD wallet"), "Classic Bifold Wallet");
        assert_eq!(title_case("cinturón de cuero"), "Cinturón De Cuero");
        assert_eq!(title_case(""), "");
    }

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("HW-001"), "HW-001");
        assert_eq!(percent_encode("HW 001/A"), "HW%20001%2FA");
        assert_eq!(percent_encode("señal"), "se%C3%B1al");
    }

    #[test]
    fn test_brace_normalization() {
        assert_eq!(brace("custom"), "{{custom}}");
        assert_eq!(brace("{{custom}}"), "{{custom}}");
        assert_eq!(brace(" {custom} "), "{{custom}}");
    }

    // ========== Date Helper Tests ==========

    #[test]
    fn test_parse_flexible_shapes() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(parse_flexible("2024-03-01"), Some(expected));
        assert_eq!(parse_flexible("2024-03-01 10:30:00"), Some(expected));
        assert_eq!(parse_flexible("2024-03-01T10:30:00Z"), Some(expected));
        assert_eq!(parse_flexible("01/03/2024"), Some(expected));
        assert_eq!(parse_flexible("01/03/24"), Some(expected));
        assert_eq!(parse_flexible("first of march"), None);
        assert_eq!(parse_flexible(""), None);
    }

    #[test]
    fn test_format_long() {
        assert_eq!(format_long("2024-03-01"), "01 March 2024");
        assert_eq!(format_long("31/12/23"), "31 December 2023");
        // Unparseable passes verbatim (treated as already formatted)
        assert_eq!(format_long("Spring 2024"), "Spring 2024");
    }

    #[test]
    fn test_format_short() {
        assert_eq!(format_short("2024-03-01"), "01/03/24");
        assert_eq!(format_short("01/03/2024"), "01/03/24");
        assert_eq!(format_short("01/03/24"), "01/03/24");
        assert_eq!(format_short("soon"), "soon");
    }

    // ========== Resolver Tests ==========

    fn test_settings() -> Settings {
        Settings {
            qr_base_url: "https://example.com/manual/".to_string(),
            // Nothing listens here; QR generation falls back locally
            qr_endpoint: "http://127.0.0.1:9/".to_string(),
            ..Settings::default()
        }
    }

    fn resolver_with(
        mappings: Vec<Mapping>,
        settings: Settings,
    ) -> (tempfile::TempDir, Arc<JsonEntityStore>, TokenResolver) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonEntityStore::open(dir.path().join("entities")).unwrap());
        let settings = Arc::new(settings);
        let qr = Arc::new(QrClient::new(&settings.qr_endpoint).unwrap());
        let resolver = TokenResolver::new(store.clone(), settings, Arc::new(mappings), qr);
        (dir, store, resolver)
    }

    fn sample_entity() -> Entity {
        let mut entity = Entity::new(11, "classic bifold wallet");
        entity.created_at = Utc.with_ymd_and_hms(2024, 2, 20, 9, 0, 0).unwrap();
        let fields = [
            ("serial_code", "HW-011"),
            ("material", "Full Grain"),
            ("leather_type", "Vegetable Tanned"),
            ("color", "Tan"),
            ("size", "9 x 11 cm"),
            ("transaction_date", "2024-03-01"),
        ];
        for (k, v) in fields {
            entity.fields.insert(k.to_string(), v.to_string());
        }
        entity
    }

    #[tokio::test]
    async fn test_resolve_built_ins() {
        let (_dir, store, resolver) = resolver_with(Vec::new(), test_settings());
        store.put(&sample_entity()).unwrap();

        let tokens = resolver.resolve(11, &BTreeMap::new()).await.unwrap();

        assert_eq!(tokens["{{serial_code}}"], "HW-011");
        assert_eq!(tokens["{{product_name}}"], "Classic Bifold Wallet");
        assert_eq!(tokens["{{material}}"], "Full Grain");
        assert_eq!(tokens["{{transaction_date}}"], "01 March 2024");
        assert_eq!(tokens["{{qr_url}}"], "https://example.com/manual/HW-011");
        assert_eq!(tokens["{{brand_slogan}}"], "Crafted for the Journey");
        assert_eq!(tokens["{{version}}"], env!("CARGO_PKG_VERSION"));
        // No stored order date: falls back to the short transaction date
        assert_eq!(tokens["{{order_date}}"], "01/03/24");
        // QR fell back locally and still carries the URL
        assert!(tokens["{{qr_svg}}"].contains("<svg"));
    }

    #[tokio::test]
    async fn test_resolve_missing_entity_is_empty() {
        let (_dir, _store, resolver) = resolver_with(Vec::new(), test_settings());
        let tokens = resolver.resolve(404, &BTreeMap::new()).await.unwrap();
        assert!(tokens.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_wrong_kind_is_empty() {
        let (_dir, store, resolver) = resolver_with(Vec::new(), test_settings());
        let mut entity = sample_entity();
        entity.kind = "page".to_string();
        store.put(&entity).unwrap();

        let tokens = resolver.resolve(11, &BTreeMap::new()).await.unwrap();
        assert!(tokens.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_sanitizes_field_markup() {
        let (_dir, store, resolver) = resolver_with(Vec::new(), test_settings());
        let mut entity = sample_entity();
        entity
            .fields
            .insert("material".to_string(), "<b>Full</b> & Grain".to_string());
        store.put(&entity).unwrap();

        let tokens = resolver.resolve(11, &BTreeMap::new()).await.unwrap();
        assert_eq!(tokens["{{material}}"], "Full &amp; Grain");
    }

    #[tokio::test]
    async fn test_qr_url_encodes_the_raw_serial() {
        let (_dir, store, resolver) = resolver_with(Vec::new(), test_settings());
        let mut entity = sample_entity();
        entity
            .fields
            .insert("serial_code".to_string(), "HW&001 A".to_string());
        store.put(&entity).unwrap();

        let tokens = resolver.resolve(11, &BTreeMap::new()).await.unwrap();
        // The URL escapes the serial once; the token carries the HTML form
        assert_eq!(
            tokens["{{qr_url}}"],
            "https://example.com/manual/HW%26001%20A"
        );
        assert_eq!(tokens["{{serial_code}}"], "HW&amp;001 A");
    }

    #[tokio::test]
    async fn test_serial_falls_back_to_title() {
        let (_dir, store, resolver) = resolver_with(Vec::new(), test_settings());
        let mut entity = sample_entity();
        entity.fields.remove("serial_code");
        entity.title = "HW-TITLE".to_string();
        store.put(&entity).unwrap();

        let tokens = resolver.resolve(11, &BTreeMap::new()).await.unwrap();
        assert_eq!(tokens["{{serial_code}}"], "HW-TITLE");
    }

    #[tokio::test]
    async fn test_mapping_fills_and_falls_back() {
        let mappings = vec![
            Mapping {
                token: "warranty".to_string(),
                source: "warranty_years".to_string(),
                fallback: "2 years".to_string(),
            },
            Mapping {
                token: "origin".to_string(),
                source: "origin".to_string(),
                fallback: String::new(),
            },
        ];
        let (_dir, store, resolver) = resolver_with(mappings, test_settings());
        let mut entity = sample_entity();
        entity
            .fields
            .insert("origin".to_string(), "Yogyakarta".to_string());
        store.put(&entity).unwrap();

        let tokens = resolver.resolve(11, &BTreeMap::new()).await.unwrap();
        // No warranty_years field: static fallback used
        assert_eq!(tokens["{{warranty}}"], "2 years");
        // Field present: field value used
        assert_eq!(tokens["{{origin}}"], "Yogyakarta");
    }

    #[tokio::test]
    async fn test_mapping_never_blanks_a_built_in() {
        let mappings = vec![Mapping {
            token: "material".to_string(),
            source: "nonexistent_field".to_string(),
            fallback: String::new(),
        }];
        let (_dir, store, resolver) = resolver_with(mappings, test_settings());
        store.put(&sample_entity()).unwrap();

        let tokens = resolver.resolve(11, &BTreeMap::new()).await.unwrap();
        // Empty source and no fallback leave the resolved value alone
        assert_eq!(tokens["{{material}}"], "Full Grain");
    }

    #[tokio::test]
    async fn test_overrides_win_and_order_date_is_short() {
        let (_dir, store, resolver) = resolver_with(Vec::new(), test_settings());
        store.put(&sample_entity()).unwrap();

        let mut overrides = BTreeMap::new();
        overrides.insert("customer_name".to_string(), "Jane".to_string());
        overrides.insert("{{order_date}}".to_string(), "2024-03-01".to_string());

        let tokens = resolver.resolve(11, &overrides).await.unwrap();
        assert_eq!(tokens["{{customer_name}}"], "Jane");
        assert_eq!(tokens["{{order_date}}"], "01/03/24");
    }

    #[tokio::test]
    async fn test_empty_transaction_date_yields_empty_date_tokens() {
        let (_dir, store, resolver) = resolver_with(Vec::new(), test_settings());
        let mut entity = sample_entity();
        entity.fields.remove("transaction_date");
        store.put(&entity).unwrap();

        let tokens = resolver.resolve(11, &BTreeMap::new()).await.unwrap();
        assert_eq!(tokens["{{transaction_date}}"], "");
        assert_eq!(tokens["{{order_date}}"], "");
    }

    #[tokio::test]
    async fn test_stored_order_date_passes_through() {
        let (_dir, store, resolver) = resolver_with(Vec::new(), test_settings());
        let mut entity = sample_entity();
        entity
            .meta
            .insert(META_ORDER_DATE.to_string(), "05/01/24".to_string());
        store.put(&entity).unwrap();

        let tokens = resolver.resolve(11, &BTreeMap::new()).await.unwrap();
        assert_eq!(tokens["{{order_date}}"], "05/01/24");
    }

    #[tokio::test]
    async fn test_resolve_twice_differs_only_in_generated_at() {
        let (_dir, store, resolver) = resolver_with(Vec::new(), test_settings());
        store.put(&sample_entity()).unwrap();

        let mut first = resolver.resolve(11, &BTreeMap::new()).await.unwrap();
        let mut second = resolver.resolve(11, &BTreeMap::new()).await.unwrap();
        first.remove("{{generated_at}}");
        second.remove("{{generated_at}}");
        assert_eq!(first, second);
    }
}
