//! Rule-table field extraction for crawled gym text.
//!
//! Price rules live in [`PRICE_RULES`] in priority order. Within a slot the
//! first rule that yields a plausible amount wins. Minimum, range and bare
//! rules only fire when every stronger slot came up empty.

use std::ops::Range;

use gymfuse_core::{ExtractionResult, Field, RuleEvidence};
use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

const AMOUNT: &str = r"(?P<amount>\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)\s*(?P<unit>만\s*원|원)";
const AMOUNT2: &str = r"(?P<amount2>\d{1,3}(?:,\d{3})+|\d+(?:\.\d+)?)\s*(?P<unit2>만\s*원|원)";

const MIN_PLAUSIBLE_WON: u64 = 1_000;
const MAX_PLAUSIBLE_WON: u64 = 20_000_000;
const MAX_TEXT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSlot {
    Membership,
    Pt,
    Gx,
    DayPass,
    Discount,
    Minimum,
    Range,
    Bare,
}

impl PriceSlot {
    fn is_category(self) -> bool {
        matches!(
            self,
            PriceSlot::Membership | PriceSlot::Pt | PriceSlot::Gx | PriceSlot::DayPass
        )
    }

    fn label(self) -> &'static str {
        match self {
            PriceSlot::Membership => "회원권",
            PriceSlot::Pt => "PT",
            PriceSlot::Gx => "GX",
            PriceSlot::DayPass => "일일권",
            PriceSlot::Discount => "할인",
            PriceSlot::Minimum => "최저가",
            PriceSlot::Range => "가격대",
            PriceSlot::Bare => "가격",
        }
    }
}

/// Confidence tiers. Downstream price resolution depends on this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTier {
    Exact,
    Secondary,
    Minimum,
    Range,
    Bare,
}

impl RuleTier {
    pub const fn confidence(self) -> f64 {
        match self {
            RuleTier::Exact => 0.9,
            RuleTier::Secondary => 0.8,
            RuleTier::Minimum | RuleTier::Range => 0.7,
            RuleTier::Bare => 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceRule {
    pub id: &'static str,
    pub slot: PriceSlot,
    pub tier: RuleTier,
    /// `{AMOUNT}` and `{AMOUNT2}` expand to the shared won-amount fragment.
    pub pattern: &'static str,
}

/// Labeled rules of every category run before any secondary rule. Each category
/// hit is masked, so a bare month phrase cannot reclaim a PT/GX/day-pass price.
pub const PRICE_RULES: &[PriceRule] = &[
    PriceRule {
        id: "discount.amount",
        slot: PriceSlot::Discount,
        tier: RuleTier::Secondary,
        pattern: r"(?:할인\s*가?|이벤트\s*가?|특가|프로모션)\s*[:：]?\s*{AMOUNT}",
    },
    PriceRule {
        id: "discount.percent",
        slot: PriceSlot::Discount,
        tier: RuleTier::Secondary,
        pattern: r"(?P<pct>\d{1,2})\s*%\s*(?:할인|세일|(?i:off))",
    },
    PriceRule {
        id: "membership.labeled",
        slot: PriceSlot::Membership,
        tier: RuleTier::Exact,
        pattern: r"(?:헬스\s*(?:이용권|회원권)?|회원권|이용권|월\s*회비|월\s*이용료|(?i:membership))\s*(?:1\s*개월\s*)?[:：]?\s*{AMOUNT}",
    },
    PriceRule {
        id: "pt.labeled",
        slot: PriceSlot::Pt,
        tier: RuleTier::Exact,
        pattern: r"(?:(?i:pt)|피티|퍼스널\s*트레이닝|개인\s*레슨)\s*(?:\d+\s*(?:회|개월)\s*|월\s*)?[:：]?\s*{AMOUNT}",
    },
    PriceRule {
        id: "gx.labeled",
        slot: PriceSlot::Gx,
        tier: RuleTier::Exact,
        pattern: r"(?:(?i:gx)|그룹\s*(?:운동|레슨|수업)|스피닝|줌바|에어로빅)\s*(?:\d+\s*개월\s*|월\s*)?[:：]?\s*{AMOUNT}",
    },
    PriceRule {
        id: "day_pass.labeled",
        slot: PriceSlot::DayPass,
        tier: RuleTier::Exact,
        pattern: r"(?:일일\s*(?:이용)?권|1\s*일\s*권|일회\s*이용권|일회권|데이\s*패스|(?i:day\s*pass))\s*[:：]?\s*{AMOUNT}",
    },
    PriceRule {
        id: "membership.per_month",
        slot: PriceSlot::Membership,
        tier: RuleTier::Secondary,
        pattern: r"{AMOUNT}\s*/\s*(?:월|1\s*개월|한\s*달)",
    },
    PriceRule {
        id: "membership.month_prefix",
        slot: PriceSlot::Membership,
        tier: RuleTier::Secondary,
        pattern: r"(?:^|\s)(?:월|1\s*개월|한\s*달)\s*[:：]?\s*{AMOUNT}",
    },
    PriceRule {
        id: "pt.loose",
        slot: PriceSlot::Pt,
        tier: RuleTier::Secondary,
        pattern: r"(?:(?i:pt)|피티)[^\d\n]{1,12}{AMOUNT}",
    },
    PriceRule {
        id: "gx.loose",
        slot: PriceSlot::Gx,
        tier: RuleTier::Secondary,
        pattern: r"(?:(?i:gx)|그룹\s*(?:운동|레슨|수업))[^\d\n]{1,12}{AMOUNT}",
    },
    PriceRule {
        id: "day_pass.loose",
        slot: PriceSlot::DayPass,
        tier: RuleTier::Secondary,
        pattern: r"(?:하루|1일)\s*(?:이용\s*)?[:：]?\s*{AMOUNT}",
    },
    PriceRule {
        id: "minimum.from",
        slot: PriceSlot::Minimum,
        tier: RuleTier::Minimum,
        pattern: r"{AMOUNT}\s*(?:이상|부터)",
    },
    PriceRule {
        id: "range.tilde",
        slot: PriceSlot::Range,
        tier: RuleTier::Range,
        pattern: r"{AMOUNT}\s*[~\-]\s*{AMOUNT2}",
    },
    PriceRule {
        id: "bare.won",
        slot: PriceSlot::Bare,
        tier: RuleTier::Bare,
        pattern: r"{AMOUNT}",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalField {
    Phone,
    Hours,
    AllDay,
    Rating,
    ReviewCount,
}

#[derive(Debug, Clone, Copy)]
struct SignalRule {
    id: &'static str,
    field: SignalField,
    confidence: f64,
    pattern: &'static str,
}

const SIGNAL_RULES: &[SignalRule] = &[
    SignalRule {
        id: "phone.kr",
        field: SignalField::Phone,
        confidence: 0.8,
        pattern: r"(?P<phone>0\d{1,2}[-.)\s]\s?\d{3,4}[-.\s]\d{4}|1[5-9]\d{2}-\d{4})",
    },
    SignalRule {
        id: "hours.range",
        field: SignalField::Hours,
        confidence: 0.8,
        pattern: r"(?P<open>[0-2]?\d:[0-5]\d)\s*[~\-–]\s*(?P<close>[0-2]?\d:[0-5]\d)",
    },
    SignalRule {
        id: "hours.all_day",
        field: SignalField::AllDay,
        confidence: 0.7,
        pattern: r"24\s*시간\s*(?:운영|영업|오픈)?",
    },
    SignalRule {
        id: "rating.labeled",
        field: SignalField::Rating,
        confidence: 0.8,
        pattern: r"(?:평점|별점|★|(?i:rating))\s*[:：]?\s*(?P<rating>[0-5](?:\.\d{1,2})?)",
    },
    SignalRule {
        id: "reviews.labeled",
        field: SignalField::ReviewCount,
        confidence: 0.7,
        pattern: r"(?:방문자\s*리뷰|리뷰|후기|(?i:reviews?))\s*[:：]?\s*(?P<count>\d{1,3}(?:,\d{3})+|\d+)",
    },
    SignalRule {
        id: "reviews.counted",
        field: SignalField::ReviewCount,
        confidence: 0.7,
        pattern: r"(?P<count>\d{1,3}(?:,\d{3})+|\d+)\s*개의?\s*(?:리뷰|후기)",
    },
];

/// Canonical facility name followed by the spellings that map to it.
const FACILITY_KEYWORDS: &[(&str, &[&str])] = &[
    ("샤워실", &["샤워"]),
    ("탈의실", &["탈의실"]),
    ("락커", &["락커", "라커", "사물함"]),
    ("주차", &["주차"]),
    ("사우나", &["사우나"]),
    ("수건", &["수건"]),
    ("운동복", &["운동복"]),
    ("인바디", &["인바디", "inbody"]),
    ("와이파이", &["와이파이", "wifi", "wi-fi"]),
    ("파우더룸", &["파우더룸"]),
];
const FACILITY_RULE_ID: &str = "facilities.keyword";
const FACILITY_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("rule {rule_id} has an invalid pattern: {source}")]
    Pattern {
        rule_id: &'static str,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
struct CompiledPriceRule {
    rule: PriceRule,
    regex: Regex,
}

#[derive(Debug, Clone)]
struct CompiledSignalRule {
    rule: SignalRule,
    regex: Regex,
}

#[derive(Debug, Clone)]
struct RuleHit {
    value: String,
    span: Range<usize>,
    snippet: String,
}

/// Compiled, ordered extraction rules. Cheap to share behind a reference.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    price_rules: Vec<CompiledPriceRule>,
    signal_rules: Vec<CompiledSignalRule>,
}

impl Default for FieldExtractor {
    fn default() -> Self {
        Self::new().expect("built-in extraction rules compile")
    }
}

impl FieldExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        Self::with_price_rules(PRICE_RULES)
    }

    /// Build an extractor over a custom price rule table; order is priority.
    pub fn with_price_rules(rules: &[PriceRule]) -> Result<Self, ExtractError> {
        let price_rules = rules
            .iter()
            .map(|rule| {
                let pattern = rule
                    .pattern
                    .replace("{AMOUNT2}", AMOUNT2)
                    .replace("{AMOUNT}", AMOUNT);
                Regex::new(&pattern)
                    .map(|regex| CompiledPriceRule { rule: *rule, regex })
                    .map_err(|source| ExtractError::Pattern {
                        rule_id: rule.id,
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let signal_rules = SIGNAL_RULES
            .iter()
            .map(|rule| {
                Regex::new(rule.pattern)
                    .map(|regex| CompiledSignalRule { rule: *rule, regex })
                    .map_err(|source| ExtractError::Pattern {
                        rule_id: rule.id,
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            price_rules,
            signal_rules,
        })
    }

    pub fn rules(&self) -> impl Iterator<Item = &PriceRule> {
        self.price_rules.iter().map(|c| &c.rule)
    }

    /// Run a single price rule in isolation, ignoring slot gating.
    pub fn apply_rule(&self, rule_id: &str, text: &str) -> Option<String> {
        let compiled = self.price_rules.iter().find(|c| c.rule.id == rule_id)?;
        first_price_hit(compiled, text).map(|hit| hit.value)
    }

    /// Extract from a JSON value; anything but a string yields an empty result.
    pub fn extract_value(&self, value: &JsonValue) -> ExtractionResult {
        match value.as_str() {
            Some(text) => self.extract(text),
            None => ExtractionResult::empty(),
        }
    }

    pub fn extract(&self, text: &str) -> ExtractionResult {
        let text = clamp_text(text);
        if text.trim().is_empty() {
            return ExtractionResult::empty();
        }

        let mut out = ExtractionResult::empty();
        let mut masked = text.to_string();
        let mut filled: Vec<PriceSlot> = Vec::new();
        let mut best: Option<(f64, &'static str)> = None;
        let mut details: Vec<String> = Vec::new();

        for compiled in &self.price_rules {
            let rule = compiled.rule;
            if filled.contains(&rule.slot) || !slot_open(rule.slot, &filled) {
                continue;
            }
            let source = if rule.slot == PriceSlot::Discount {
                text
            } else {
                masked.as_str()
            };
            let Some(hit) = first_price_hit(compiled, source) else {
                continue;
            };
            let confidence = rule.tier.confidence();
            let evidence = RuleEvidence {
                rule_id: rule.id.to_string(),
                confidence,
                snippet: hit.snippet.clone(),
            };
            if rule.slot == PriceSlot::Discount || rule.slot.is_category() {
                blank_span(&mut masked, hit.span.clone());
            }
            if rule.slot != PriceSlot::Discount
                && best.map(|(c, _)| confidence > c).unwrap_or(true)
            {
                best = Some((confidence, rule.id));
            }
            if rule.slot.is_category() {
                details.push(format!("{} {}", rule.slot.label(), hit.value));
            }
            let field = Field::with_value_and_evidence(hit.value, evidence);
            match rule.slot {
                PriceSlot::Membership => out.membership_price = field,
                PriceSlot::Pt => out.pt_price = field,
                PriceSlot::Gx => out.gx_price = field,
                PriceSlot::DayPass => out.day_pass_price = field,
                PriceSlot::Discount => out.discount_info = field,
                PriceSlot::Minimum => out.minimum_price = field,
                PriceSlot::Range | PriceSlot::Bare => out.generic_price = field,
            }
            filled.push(rule.slot);
            if rule.slot == PriceSlot::Range {
                filled.push(PriceSlot::Bare);
            }
        }

        if let Some((confidence, rule_id)) = best {
            out.confidence = confidence;
            out.rule_id = Some(rule_id.to_string());
        }
        if !details.is_empty() {
            out.price_details = Some(details.join(" / "));
        }

        self.apply_signals(text, &mut out);
        out.facilities = extract_facilities(text);
        out
    }

    fn apply_signals(&self, text: &str, out: &mut ExtractionResult) {
        for compiled in &self.signal_rules {
            let rule = compiled.rule;
            let evidence = |snippet: &str| RuleEvidence {
                rule_id: rule.id.to_string(),
                confidence: rule.confidence,
                snippet: collapse_whitespace(snippet),
            };
            match rule.field {
                SignalField::Phone if !out.phone.is_present() => {
                    if let Some(caps) = compiled.regex.captures(text) {
                        let phone = normalize_phone(&caps["phone"]);
                        out.phone = Field::with_value_and_evidence(phone, evidence(&caps[0]));
                    }
                }
                SignalField::Hours if !out.open_hour.is_present() => {
                    if let Some(caps) = compiled.regex.captures(text) {
                        if let (Some(open), Some(close)) =
                            (normalize_clock(&caps["open"]), normalize_clock(&caps["close"]))
                        {
                            out.open_hour = Field::with_value_and_evidence(open, evidence(&caps[0]));
                            out.close_hour = Field::with_value_and_evidence(close, evidence(&caps[0]));
                        }
                    }
                }
                SignalField::AllDay if !out.open_hour.is_present() => {
                    if let Some(m) = compiled.regex.find(text) {
                        out.open_hour =
                            Field::with_value_and_evidence("00:00".to_string(), evidence(m.as_str()));
                        out.close_hour =
                            Field::with_value_and_evidence("24:00".to_string(), evidence(m.as_str()));
                    }
                }
                SignalField::Rating if !out.rating.is_present() => {
                    let rating = compiled.regex.captures(text).and_then(|caps| {
                        let value = caps["rating"].parse::<f64>().ok()?;
                        (0.0..=5.0).contains(&value).then(|| (value, caps[0].to_string()))
                    });
                    if let Some((value, snippet)) = rating {
                        out.rating = Field::with_value_and_evidence(value, evidence(&snippet));
                    }
                }
                SignalField::ReviewCount if !out.review_count.is_present() => {
                    let count = compiled.regex.captures(text).and_then(|caps| {
                        let value = caps["count"].replace(',', "").parse::<u32>().ok()?;
                        Some((value, caps[0].to_string()))
                    });
                    if let Some((value, snippet)) = count {
                        out.review_count = Field::with_value_and_evidence(value, evidence(&snippet));
                    }
                }
                _ => {}
            }
        }
    }
}

/// A weaker slot only opens once every stronger one came up empty.
fn slot_open(slot: PriceSlot, filled: &[PriceSlot]) -> bool {
    let any_category = filled.iter().any(|s| s.is_category());
    match slot {
        PriceSlot::Minimum => !any_category,
        PriceSlot::Range => !any_category && !filled.contains(&PriceSlot::Minimum),
        PriceSlot::Bare => {
            !any_category
                && !filled.contains(&PriceSlot::Minimum)
                && !filled.contains(&PriceSlot::Range)
        }
        _ => true,
    }
}

fn first_price_hit(compiled: &CompiledPriceRule, text: &str) -> Option<RuleHit> {
    compiled
        .regex
        .captures_iter(text)
        .find_map(|caps| price_hit(compiled.rule.slot, &caps))
}

fn price_hit(slot: PriceSlot, caps: &Captures<'_>) -> Option<RuleHit> {
    let whole = caps.get(0)?;
    let snippet = collapse_whitespace(whole.as_str());
    let value = if let Some(pct) = caps.name("pct") {
        let pct: u32 = pct.as_str().parse().ok()?;
        if pct == 0 {
            return None;
        }
        format!("{pct}% 할인")
    } else {
        let won = won_amount(caps.name("amount")?.as_str(), caps.name("unit")?.as_str())?;
        match slot {
            PriceSlot::Discount => snippet.clone(),
            PriceSlot::Minimum => format!("{}부터", format_won(won)),
            PriceSlot::Range => {
                let upper = won_amount(caps.name("amount2")?.as_str(), caps.name("unit2")?.as_str())?;
                if upper < won {
                    return None;
                }
                format!("{} ~ {}", format_won(won), format_won(upper))
            }
            _ => format_won(won),
        }
    };
    Some(RuleHit {
        value,
        span: whole.range(),
        snippet,
    })
}

fn won_amount(amount: &str, unit: &str) -> Option<u64> {
    let cleaned: String = amount.chars().filter(|c| *c != ',').collect();
    let base: f64 = cleaned.parse().ok()?;
    let value = if unit.starts_with('만') {
        base * 10_000.0
    } else {
        base
    };
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let won = value.round() as u64;
    (MIN_PLAUSIBLE_WON..=MAX_PLAUSIBLE_WON)
        .contains(&won)
        .then_some(won)
}

/// `80000` -> `"80,000원"`.
pub fn format_won(won: u64) -> String {
    let digits = won.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out.push('원');
    out
}

fn normalize_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        8 => format!("{}-{}", &digits[..4], &digits[4..]),
        9 => format!("{}-{}-{}", &digits[..2], &digits[2..5], &digits[5..]),
        10 if digits.starts_with("02") => {
            format!("{}-{}-{}", &digits[..2], &digits[2..6], &digits[6..])
        }
        10 => format!("{}-{}-{}", &digits[..3], &digits[3..6], &digits[6..]),
        11 => format!("{}-{}-{}", &digits[..3], &digits[3..7], &digits[7..]),
        _ => raw.trim().to_string(),
    }
}

fn normalize_clock(raw: &str) -> Option<String> {
    let (h, m) = raw.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h <= 24 && m < 60).then(|| format!("{h:02}:{m:02}"))
}

fn extract_facilities(text: &str) -> Field<Vec<String>> {
    let lower = text.to_lowercase();
    let found: Vec<String> = FACILITY_KEYWORDS
        .iter()
        .filter(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(name, _)| name.to_string())
        .collect();
    if found.is_empty() {
        return Field::empty();
    }
    let snippet = found.join(", ");
    Field::with_value_and_evidence(
        found,
        RuleEvidence {
            rule_id: FACILITY_RULE_ID.to_string(),
            confidence: FACILITY_CONFIDENCE,
            snippet,
        },
    )
}

fn blank_span(text: &mut String, span: Range<usize>) {
    let blank = " ".repeat(span.len());
    text.replace_range(span, &blank);
}

fn clamp_text(text: &str) -> &str {
    if text.len() <= MAX_TEXT_BYTES {
        return text;
    }
    let mut end = MAX_TEXT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
