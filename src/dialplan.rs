//! Dialed-number classification and per-client dial rule documents
//!
//! Pure functions over an immutable rule table; nothing here touches the
//! socket. Patterns use the exchange's notation: a leading `_` marks a
//! pattern in which `X` is any digit, `Z` is 1-9, `N` is 2-9, `[...]` is a
//! character set with ranges, `.` matches one or more further characters and
//! `!` zero or more. Patterns without `_` match literally.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::{
    constants::MAX_DIAL_LEN,
    error::{ValidationError, ValidationErrorKind},
};

/// Error returned when parsing an unknown classification or profile name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDialPlanNameError(pub String);

impl std::fmt::Display for ParseDialPlanNameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown dial plan name: {}", self.0)
    }
}

impl std::error::Error for ParseDialPlanNameError {}

define_header_enum! {
    error_type: ParseDialPlanNameError,
    /// What kind of destination a dialed number reaches.
    pub enum Classification {
        FeatureCode => "featureCode",
        Extension => "extension",
        LocalNumber => "localNumber",
        /// Matched a blocked range; never dialable.
        Invalid => "invalid",
        DomesticLongDistance => "domesticLongDistance",
        InternationalNumber => "internationalNumber",
    }
}

impl Classification {
    /// Matching precedence; lower is tried first.
    fn rank(self) -> u8 {
        match self {
            Classification::FeatureCode => 0,
            Classification::Extension => 1,
            Classification::LocalNumber => 2,
            Classification::Invalid => 3,
            Classification::DomesticLongDistance => 4,
            Classification::InternationalNumber => 5,
        }
    }
}

impl Serialize for Classification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

define_header_enum! {
    error_type: ParseDialPlanNameError,
    /// Output schema for [`DialPlanManager::get_dial_rules`].
    pub enum ClientProfile {
        /// JSON document carrying the full rule table.
        Canonical => "canonical",
        /// SIP digit map, `(a|b|c)`.
        Digitmap => "digitmap",
        /// Grandstream dial plan, `{ a | b | c }`.
        Grandstream => "grandstream",
        /// Cisco XML dial template.
        Cisco => "cisco",
    }
}

impl ClientProfile {
    /// Look up a profile by name, falling back to `Canonical`.
    pub fn resolve(name: &str) -> Self {
        name.trim()
            .parse()
            .unwrap_or_else(|_| {
                debug!("Unknown client profile {:?}, using canonical", name);
                ClientProfile::Canonical
            })
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ClientProfile::Canonical => "application/json",
            ClientProfile::Digitmap | ClientProfile::Grandstream => "text/plain",
            ClientProfile::Cisco => "application/xml",
        }
    }
}

impl Serialize for ClientProfile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    Set(Vec<(char, char)>),
    OneOrMore,
    ZeroOrMore,
}

impl Token {
    fn digit_range(lo: char, hi: char) -> Self {
        Token::Set(vec![(lo, hi)])
    }

    fn accepts(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::Set(ranges) => ranges
                .iter()
                .any(|&(lo, hi)| lo <= c && c <= hi),
            Token::OneOrMore | Token::ZeroOrMore => true,
        }
    }

    fn is_any_digit(&self) -> bool {
        matches!(self, Token::Set(ranges) if ranges.as_slice() == [('0', '9')])
    }

    /// `[2-7]` / `[135]` style rendering shared by the digit-map dialects.
    fn set_notation(ranges: &[(char, char)]) -> String {
        let mut out = String::from("[");
        for &(lo, hi) in ranges {
            out.push(lo);
            if hi != lo {
                out.push('-');
                out.push(hi);
            }
        }
        out.push(']');
        out
    }
}

/// A compiled match pattern.
///
/// Parsing never fails: an unterminated `[` set runs to the end of the
/// pattern, and anything after `.` or `!` is ignored.
///
/// ```
/// use asterisk_ami_tokio::DialPattern;
///
/// let pattern = DialPattern::parse("_1NXXNXXXXXX");
/// assert!(pattern.matches("18005551234"));
/// assert!(!pattern.matches("10005551234"));
/// assert!(DialPattern::parse("*97").matches("*97"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialPattern {
    source: String,
    tokens: Vec<Token>,
}

impl DialPattern {
    pub fn parse(source: &str) -> Self {
        let tokens = match source.strip_prefix('_') {
            Some(body) => Self::tokenize(body),
            None => source
                .chars()
                .map(Token::Literal)
                .collect(),
        };
        Self {
            source: source.to_string(),
            tokens,
        }
    }

    fn tokenize(body: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut chars = body.chars();
        while let Some(c) = chars.next() {
            let token = match c.to_ascii_uppercase() {
                'X' => Token::digit_range('0', '9'),
                'Z' => Token::digit_range('1', '9'),
                'N' => Token::digit_range('2', '9'),
                '.' => Token::OneOrMore,
                '!' => Token::ZeroOrMore,
                '[' => {
                    let mut ranges = Vec::new();
                    let mut pending: Option<char> = None;
                    let mut range_open = false;
                    for s in chars.by_ref() {
                        match s {
                            ']' => break,
                            '-' if pending.is_some() => range_open = true,
                            _ if range_open => {
                                if let Some(lo) = pending.take() {
                                    ranges.push((lo.min(s), lo.max(s)));
                                }
                                range_open = false;
                            }
                            _ => {
                                if let Some(lo) = pending.replace(s) {
                                    ranges.push((lo, lo));
                                }
                            }
                        }
                    }
                    if let Some(lo) = pending {
                        ranges.push((lo, lo));
                    }
                    Token::Set(ranges)
                }
                _ => Token::Literal(c),
            };
            let terminal = matches!(token, Token::OneOrMore | Token::ZeroOrMore);
            tokens.push(token);
            if terminal {
                break;
            }
        }
        tokens
    }

    /// Whether the whole of `input` matches.
    pub fn matches(&self, input: &str) -> bool {
        let mut rest = input.chars();
        for token in &self.tokens {
            match token {
                Token::OneOrMore => return rest.next().is_some(),
                Token::ZeroOrMore => return true,
                _ => match rest.next() {
                    Some(c) if token.accepts(c) => {}
                    _ => return false,
                },
            }
        }
        rest.next().is_none()
    }

    /// Pattern text as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// `false` when the pattern ends in `.` or `!`.
    pub fn is_fixed_length(&self) -> bool {
        !self
            .tokens
            .iter()
            .any(|t| matches!(t, Token::OneOrMore | Token::ZeroOrMore))
    }

    fn digitmap(&self) -> String {
        self.tokens
            .iter()
            .map(|t| match t {
                Token::Literal(c) => c.to_string(),
                t if t.is_any_digit() => "x".to_string(),
                Token::Set(ranges) => Token::set_notation(ranges),
                Token::OneOrMore => "xx.".to_string(),
                Token::ZeroOrMore => "x.".to_string(),
            })
            .collect()
    }

    fn grandstream(&self) -> String {
        self.tokens
            .iter()
            .map(|t| match t {
                Token::Literal('+') => "\\+".to_string(),
                Token::Literal(c) => c.to_string(),
                t if t.is_any_digit() => "x".to_string(),
                Token::Set(ranges) => Token::set_notation(ranges),
                // No zero-or-more form; the stricter one-or-more stands in.
                Token::OneOrMore | Token::ZeroOrMore => "x+".to_string(),
            })
            .collect()
    }

    fn cisco(&self) -> String {
        self.tokens
            .iter()
            .map(|t| match t {
                Token::Literal('*') => "\\*".to_string(),
                Token::Literal(c) => c.to_string(),
                Token::Set(_) => ".".to_string(),
                Token::OneOrMore => ".*".to_string(),
                Token::ZeroOrMore => "*".to_string(),
            })
            .collect()
    }
}

/// One row of the rule table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialRule {
    pub name: String,
    pub pattern: String,
    pub classification: Classification,
    pub description: String,
    /// Dial string sent to the client; `{number}` is the normalized input and
    /// `{digits}` the same without a leading `+`.
    pub template: String,
}

impl DialRule {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        classification: Classification,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            classification,
            description: description.into(),
            template: "{number}".to_string(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }
}

/// A successfully classified number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedNumber {
    /// Caller's input, unmodified.
    pub input: String,
    /// Input with punctuation stripped.
    pub number: String,
    pub classification: Classification,
    pub matched_rule: String,
    #[serde(skip)]
    template: String,
}

impl ClassifiedNumber {
    /// Render the matched rule's client template.
    pub fn dial_string(&self) -> String {
        let digits = self
            .number
            .strip_prefix('+')
            .unwrap_or(&self.number);
        self.template
            .replace("{number}", &self.number)
            .replace("{digits}", digits)
    }
}

/// A rendered dial rule document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialRuleDocument {
    pub profile: ClientProfile,
    pub content_type: &'static str,
    pub body: String,
}

#[derive(Debug)]
struct CompiledRule {
    rule: DialRule,
    pattern: DialPattern,
}

/// Strip punctuation and check the remaining characters.
fn normalize(input: &str) -> Result<String, ValidationError> {
    let number: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')' | '.'))
        .collect();
    if number.is_empty() {
        return Err(ValidationError::new("number", input, ValidationErrorKind::Empty));
    }
    for (i, c) in number
        .chars()
        .enumerate()
    {
        let allowed = c.is_ascii_digit() || c == '*' || c == '#' || (c == '+' && i == 0);
        if !allowed {
            return Err(ValidationError::new(
                "number",
                input,
                ValidationErrorKind::InvalidCharacter { character: c },
            ));
        }
    }
    if number.len() > MAX_DIAL_LEN {
        return Err(ValidationError::new(
            "number",
            input,
            ValidationErrorKind::TooLong { max: MAX_DIAL_LEN },
        ));
    }
    Ok(number)
}

/// Classifies dialed numbers against an immutable rule table (Clone + Send +
/// Sync, cheap to clone).
///
/// Rules are tried in classification precedence (feature codes, extensions,
/// local numbers, blocked ranges, domestic long distance, international),
/// table order within a class; the first match wins.
///
/// ```
/// use asterisk_ami_tokio::{Classification, DialPlanManager};
///
/// let plan = DialPlanManager::standard();
/// let number = plan.validate_number("1 (800) 555-1234").unwrap();
/// assert_eq!(number.classification, Classification::DomesticLongDistance);
/// assert!(plan.validate_number("999").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct DialPlanManager {
    rules: Arc<[CompiledRule]>,
}

impl DialPlanManager {
    /// Build from a rule table; order within one classification is kept.
    pub fn new(rules: impl IntoIterator<Item = DialRule>) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .into_iter()
            .map(|rule| CompiledRule {
                pattern: DialPattern::parse(&rule.pattern),
                rule,
            })
            .collect();
        compiled.sort_by_key(|c| {
            c.rule
                .classification
                .rank()
        });
        Self {
            rules: compiled.into(),
        }
    }

    /// North American table with common feature codes.
    pub fn standard() -> Self {
        use Classification::*;
        Self::new([
            DialRule::new("voicemail", "*97", FeatureCode, "Check own voicemail"),
            DialRule::new("voicemail-any", "*98", FeatureCode, "Check any voicemail box"),
            DialRule::new("forward-on", "*72", FeatureCode, "Activate call forwarding"),
            DialRule::new("forward-off", "*73", FeatureCode, "Deactivate call forwarding"),
            DialRule::new("dnd-on", "*78", FeatureCode, "Do not disturb on"),
            DialRule::new("dnd-off", "*79", FeatureCode, "Do not disturb off"),
            DialRule::new("echo-test", "*43", FeatureCode, "Echo test"),
            DialRule::new("extension", "_[2-7]XXX", Extension, "Internal extension"),
            DialRule::new("emergency", "911", LocalNumber, "Emergency services"),
            DialRule::new("local-7", "_NXXXXXX", LocalNumber, "Seven-digit local number"),
            DialRule::new("local-10", "_NXXNXXXXXX", LocalNumber, "Ten-digit local number"),
            DialRule::new("premium", "_1900NXXXXXX", Invalid, "Premium-rate numbers are blocked"),
            DialRule::new("long-distance", "_1NXXNXXXXXX", DomesticLongDistance, "Domestic long distance"),
            DialRule::new("international", "_011X.", InternationalNumber, "International via 011"),
            DialRule::new("international-e164", "_+X.", InternationalNumber, "International in E.164 form")
                .with_template("011{digits}"),
        ])
    }

    /// Rules in matching order.
    pub fn rules(&self) -> impl Iterator<Item = &DialRule> {
        self.rules
            .iter()
            .map(|c| &c.rule)
    }

    /// Normalize and classify a dialed number.
    ///
    /// Invalid input is an expected outcome and comes back as a
    /// [`ValidationError`] value.
    pub fn validate_number(&self, input: &str) -> Result<ClassifiedNumber, ValidationError> {
        let number = normalize(input)?;
        let Some(matched) = self
            .rules
            .iter()
            .find(|c| {
                c.pattern
                    .matches(&number)
            })
        else {
            return Err(ValidationError::new("number", input, ValidationErrorKind::Unmatched));
        };

        let rule = &matched.rule;
        if rule.classification == Classification::Invalid {
            return Err(ValidationError::new(
                "number",
                input,
                ValidationErrorKind::Blocked {
                    rule: rule
                        .name
                        .clone(),
                },
            ));
        }
        Ok(ClassifiedNumber {
            input: input.to_string(),
            number,
            classification: rule.classification,
            matched_rule: rule
                .name
                .clone(),
            template: rule
                .template
                .clone(),
        })
    }

    /// Classification only; anything rejected is `Invalid`.
    pub fn classify(&self, input: &str) -> Classification {
        self.validate_number(input)
            .map_or(Classification::Invalid, |n| n.classification)
    }

    /// Render the table for a named client profile; unknown names get the
    /// canonical document.
    pub fn get_dial_rules(&self, profile: &str) -> DialRuleDocument {
        self.render(ClientProfile::resolve(profile))
    }

    pub fn render(&self, profile: ClientProfile) -> DialRuleDocument {
        let body = match profile {
            ClientProfile::Canonical => self.render_canonical(),
            ClientProfile::Digitmap => format!(
                "({})",
                self.dialable()
                    .map(|c| c
                        .pattern
                        .digitmap())
                    .collect::<Vec<_>>()
                    .join("|")
            ),
            ClientProfile::Grandstream => format!(
                "{{ {} }}",
                self.dialable()
                    .map(|c| c
                        .pattern
                        .grandstream())
                    .collect::<Vec<_>>()
                    .join(" | ")
            ),
            ClientProfile::Cisco => self.render_cisco(),
        };
        DialRuleDocument {
            profile,
            content_type: profile.content_type(),
            body,
        }
    }

    /// Feature code to description.
    pub fn get_feature_codes(&self) -> BTreeMap<String, String> {
        self.rules
            .iter()
            .filter(|c| c.rule.classification == Classification::FeatureCode)
            .map(|c| {
                (
                    c.rule
                        .pattern
                        .clone(),
                    c.rule
                        .description
                        .clone(),
                )
            })
            .collect()
    }

    /// Rules a phone may dial; blocked ranges only appear in the canonical form.
    fn dialable(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules
            .iter()
            .filter(|c| c.rule.classification != Classification::Invalid)
    }

    fn render_canonical(&self) -> String {
        let document = serde_json::json!({
            "profile": ClientProfile::Canonical,
            "rules": self.rules().collect::<Vec<_>>(),
            "featureCodes": self.get_feature_codes(),
        });
        format!("{:#}", document)
    }

    fn render_cisco(&self) -> String {
        let mut xml = String::from("<DIALTEMPLATE>\n");
        for compiled in self.dialable() {
            let timeout = if compiled
                .pattern
                .is_fixed_length()
            {
                0
            } else {
                5
            };
            xml.push_str(&format!(
                "  <TEMPLATE MATCH=\"{}\" Timeout=\"{}\" User=\"Phone\"/>\n",
                quick_xml::escape::escape(
                    compiled
                        .pattern
                        .cisco()
                        .as_str()
                ),
                timeout
            ));
        }
        xml.push_str("</DIALTEMPLATE>\n");
        xml
    }
}

impl Default for DialPlanManager {
    fn default() -> Self {
        Self::standard()
    }
}
