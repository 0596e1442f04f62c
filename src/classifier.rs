use serde::{Deserialize, Serialize};

/// Default threshold for the length gate, in characters.
pub const DEFAULT_MIN_MESSAGE_LENGTH: usize = 20;

/// Keyword verdict for a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Classification {
    pub is_relevant: bool,
    pub has_rent_intent: bool,
    pub has_buy_intent: bool,
    pub has_property_mention: bool,
}

/// Category a keyword belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordCategory {
    Rent,
    Buy,
    Property,
}

impl KeywordCategory {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "rent" => Some(Self::Rent),
            "buy" => Some(Self::Buy),
            "property" => Some(Self::Property),
            _ => None,
        }
    }
}

/// The three substring lists used for intent detection.
///
/// All words are stored lowercased and trimmed. Matching is plain substring
/// containment on the lowercased text, so "комнат" matches both "комната" and
/// "комнату" (and anything else that happens to contain it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSet {
    #[serde(default)]
    pub rent: Vec<String>,
    #[serde(default)]
    pub buy: Vec<String>,
    #[serde(default)]
    pub property: Vec<String>,
}

impl KeywordSet {
    pub fn new<R, B, P>(rent: R, buy: B, property: P) -> Self
    where
        R: IntoIterator,
        R::Item: AsRef<str>,
        B: IntoIterator,
        B::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        Self {
            rent: normalize(rent),
            buy: normalize(buy),
            property: normalize(property),
        }
    }

    pub fn empty() -> Self {
        Self {
            rent: Vec::new(),
            buy: Vec::new(),
            property: Vec::new(),
        }
    }

    /// Add a single word to the given category. Blank words are ignored since
    /// an empty pattern would match every message.
    pub fn push(&mut self, category: KeywordCategory, word: &str) {
        let word = word.trim().to_lowercase();
        if word.is_empty() {
            return;
        }
        match category {
            KeywordCategory::Rent => self.rent.push(word),
            KeywordCategory::Buy => self.buy.push(word),
            KeywordCategory::Property => self.property.push(word),
        }
    }

    /// Re-normalize lists that came from an untrusted source (e.g. a config file).
    pub fn normalized(self) -> Self {
        Self::new(self.rent, self.buy, self.property)
    }

    pub fn len(&self) -> usize {
        self.rent.len() + self.buy.len() + self.property.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Classify a message text.
    ///
    /// A message is relevant iff it mentions a property AND shows either rent
    /// or buy intent.
    pub fn classify(&self, text: &str) -> Classification {
        let lower = text.to_lowercase();

        let has_rent_intent = contains_any(&lower, &self.rent);
        let has_buy_intent = contains_any(&lower, &self.buy);
        let has_property_mention = contains_any(&lower, &self.property);

        Classification {
            is_relevant: has_property_mention && (has_rent_intent || has_buy_intent),
            has_rent_intent,
            has_buy_intent,
            has_property_mention,
        }
    }
}

impl Default for KeywordSet {
    fn default() -> Self {
        Self::new(
            [
                "ищу аренд",
                "сниму",
                "снять",
                "нужна аренда",
                "хочу снять",
                "ищу квартиру",
                "ищу кондо",
                "на месяц",
                "долгосрок",
                "looking for rent",
                "want to rent",
                "need apartment",
            ],
            [
                "хочу купить",
                "куплю",
                "покупка",
                "бюджет на покупку",
                "инвестиц",
                "want to buy",
                "looking to buy",
            ],
            [
                "квартир",
                "кондо",
                "condo",
                "студи",
                "studio",
                "дом",
                "house",
                "вилл",
                "villa",
                "комнат",
                "room",
                "апартамент",
                "недвижимост",
                "спальн",
                "bedroom",
            ],
        )
    }
}

/// Cheap pre-filter applied before classification. Length is counted in
/// characters, not bytes, so Cyrillic text is not penalized.
pub fn passes_length_gate(text: &str, min_len: usize) -> bool {
    text.chars().count() >= min_len
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| haystack.contains(n.as_str()))
}

fn normalize<I>(words: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| w.as_ref().trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}
