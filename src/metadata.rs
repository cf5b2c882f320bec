//! Metadata extraction and document classification.
//!
//! Pattern/heuristic rules over document text: legal citations, dates,
//! courts, case names, statute and regulation identifiers, plus the
//! indicator-count classifier that assigns a [`DocumentType`] and the
//! quality score used by ingestion verification.

use chrono::NaiveDate;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::models::{DocumentMeta, DocumentType};

const CASE_INDICATORS: [&str; 12] = [
    "v.",
    "versus",
    "plaintiff",
    "defendant",
    "appellant",
    "appellee",
    "court of appeals",
    "supreme court",
    "district court",
    "opinion",
    "case no",
    "docket no",
];

const STATUTE_INDICATORS: [&str; 10] = [
    "public law",
    "statute",
    "section",
    "u.s.c.",
    "united states code",
    "legislative",
    "congress",
    "enacted",
    "chapter",
    "title",
];

const REGULATION_INDICATORS: [&str; 8] = [
    "c.f.r.",
    "code of federal regulations",
    "final rule",
    "regulation",
    "federal register",
    "proposed rule",
    "agency",
    "department of",
];

const STATE_NAMES: [&str; 50] = [
    "Alabama",
    "Alaska",
    "Arizona",
    "Arkansas",
    "California",
    "Colorado",
    "Connecticut",
    "Delaware",
    "Florida",
    "Georgia",
    "Hawaii",
    "Idaho",
    "Illinois",
    "Indiana",
    "Iowa",
    "Kansas",
    "Kentucky",
    "Louisiana",
    "Maine",
    "Maryland",
    "Massachusetts",
    "Michigan",
    "Minnesota",
    "Mississippi",
    "Missouri",
    "Montana",
    "Nebraska",
    "Nevada",
    "New Hampshire",
    "New Jersey",
    "New Mexico",
    "New York",
    "North Carolina",
    "North Dakota",
    "Ohio",
    "Oklahoma",
    "Oregon",
    "Pennsylvania",
    "Rhode Island",
    "South Carolina",
    "South Dakota",
    "Tennessee",
    "Texas",
    "Utah",
    "Vermont",
    "Virginia",
    "Washington",
    "West Virginia",
    "Wisconsin",
    "Wyoming",
];

/// Compiled pattern set for metadata extraction. Construct once and share.
pub struct MetadataExtractor {
    citations: Vec<Regex>,
    dates: Vec<Regex>,
    courts: Vec<Regex>,
    case_names: Vec<Regex>,
    judges: Regex,
    statute_title: Regex,
    effective_date: Regex,
    cfr: Regex,
    agency: Vec<Regex>,
    entities: Vec<Regex>,
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataExtractor {
    pub fn new() -> Self {
        let rx = |p: &str| Regex::new(p).expect("metadata pattern must compile");

        Self {
            citations: vec![
                rx(r"\d+\s+U\.S\.\s+\d+"),
                rx(r"\d+\s+S\.\s?Ct\.\s+\d+"),
                rx(r"\d+\s+F\.\s?[234]d\s+\d+"),
                rx(r"\d+\s+F\.\s?Supp\.\s?(?:[23]d\s+)?\d+"),
                rx(r"\d+\s+U\.S\.C\.\s+§+\s*\d+(?:\([a-z]\))?"),
            ],
            dates: vec![
                rx(r"(?:Decided|Argued|Date|Filed):?\s+([A-Z][a-z]+\s+\d{1,2},\s+\d{4})"),
                rx(r"\b(\d{4}-\d{2}-\d{2})\b"),
                rx(r"\b(\d{1,2}/\d{1,2}/\d{4})\b"),
            ],
            courts: vec![
                rx(r"Supreme Court of the United States"),
                rx(r"United States Court of Appeals for the \w+ Circuit"),
                rx(r"United States District Court for the \w+ District of \w+"),
                rx(r"Supreme Court of [A-Z][a-z]+(?: [A-Z][a-z]+)?"),
            ],
            case_names: vec![
                rx(r"(?m)^\s*([A-Z][A-Za-z.,'\- ]{2,60})\s+v\.\s+([A-Z][A-Za-z.,'\- ]{2,60})"),
                rx(r"In re\s+([A-Z][A-Za-z.,'\- ]{2,60})"),
                rx(r"Ex parte\s+([A-Z][A-Za-z.,'\- ]{2,60})"),
            ],
            judges: rx(r"(?:Chief\s+)?(?:Judge|Justice)\s+([A-Z][A-Za-z'\-]+)"),
            statute_title: rx(r"(?i)\b(?:TITLE|SECTION)\s+(\d+)[.\-—]?\s*([^\n]*)"),
            effective_date: rx(r"(?i)effective\s+(?:date[:\s]*|on\s+|as of\s+)([A-Z][a-z]+\s+\d{1,2},\s+\d{4})"),
            cfr: rx(r"(\d+)\s+C\.?F\.?R\.?\s+(?:Part\s+)?§?\s*(\d+)(?:\.(\d+))?"),
            agency: vec![
                rx(r"(?m)^AGENCY:\s+(.+)$"),
                rx(r"([A-Z][A-Za-z ]+(?:Department|Agency|Administration|Commission))"),
            ],
            entities: vec![
                rx(r"(?:plaintiff|defendant|petitioner|respondent|appellant|appellee)s?\s+([A-Z][A-Za-z., ]{2,40})"),
                rx(r"([A-Z][A-Za-z]+(?:\s+[A-Z][A-Za-z]+){0,4}),?\s+(?:Inc\.|LLC|Corp\.|Corporation|Company)"),
            ],
        }
    }

    /// Extract and enrich metadata from normalized document text.
    ///
    /// `seed` carries what the extraction format already knew (title,
    /// source URL); `collection` pins the document type when the caller
    /// put the document into a typed collection.
    pub fn extract(&self, text: &str, seed: DocumentMeta, collection: &str) -> DocumentMeta {
        let mut meta = seed;

        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        meta.content_hash = Some(format!("{:x}", hasher.finalize()));
        meta.word_count = text.split_whitespace().count();

        let doc_type = meta
            .doc_type
            .or_else(|| known_collection_type(collection))
            .or_else(|| self.classify(text));
        meta.doc_type = doc_type;

        meta.citations = self.extract_citations(text);
        if meta.date.is_none() {
            meta.date = self.extract_date(text);
        }
        if meta.jurisdiction.is_none() {
            meta.jurisdiction = self.extract_jurisdiction(text);
        }
        if meta.entities.is_empty() {
            meta.entities = self.extract_entities(text);
        }

        match doc_type {
            Some(DocumentType::CaseLaw) => self.enrich_case_law(text, &mut meta),
            Some(DocumentType::Statute) => self.enrich_statute(text, &mut meta),
            Some(DocumentType::Regulation) => self.enrich_regulation(text, &mut meta),
            Some(DocumentType::Web) | None => {}
        }

        meta
    }

    /// Classify a document by counting type indicators in its text.
    ///
    /// A type wins outright with at least 3 indicators and a strict
    /// majority; 2 or more indicators of any kind still mark the text as
    /// legal material (typed `Web`); below that the text is not a legal
    /// document and `None` is returned.
    pub fn classify(&self, text: &str) -> Option<DocumentType> {
        let lower = text.to_lowercase();
        let count =
            |indicators: &[&str]| indicators.iter().filter(|i| lower.contains(*i)).count();

        let case = count(&CASE_INDICATORS);
        let statute = count(&STATUTE_INDICATORS);
        let regulation = count(&REGULATION_INDICATORS);

        if case > statute.max(regulation) && case >= 3 {
            Some(DocumentType::CaseLaw)
        } else if statute > case.max(regulation) && statute >= 3 {
            Some(DocumentType::Statute)
        } else if regulation > case.max(statute) && regulation >= 3 {
            Some(DocumentType::Regulation)
        } else if case >= 2 || statute >= 2 || regulation >= 2 {
            Some(DocumentType::Web)
        } else {
            None
        }
    }

    /// Quality score in `[0, 1]` from metadata richness and length.
    pub fn quality_score(&self, meta: &DocumentMeta) -> f32 {
        let mut score = 0.0f32;

        if meta.word_count > 100 {
            score += 0.2;
        }
        if meta.word_count > 500 {
            score += 0.2;
        }

        if meta.title.is_some() {
            score += 0.1;
        }
        if meta.date.is_some() {
            score += 0.1;
        }
        if meta.doc_type.is_some() {
            score += 0.1;
        }

        match meta.doc_type {
            Some(DocumentType::CaseLaw) => {
                if meta.case_name.is_some() {
                    score += 0.1;
                }
                if meta.court.is_some() {
                    score += 0.1;
                }
                if !meta.citations.is_empty() {
                    score += 0.1;
                }
            }
            Some(DocumentType::Statute) => {
                if meta.statute_title.is_some() {
                    score += 0.15;
                }
                if meta.effective_date.is_some() {
                    score += 0.15;
                }
            }
            Some(DocumentType::Regulation) => {
                if meta.cfr_reference.is_some() {
                    score += 0.15;
                }
                if meta.agency.is_some() {
                    score += 0.15;
                }
            }
            Some(DocumentType::Web) | None => {}
        }

        score += (meta.entities.len() as f32 * 0.02).min(0.1);
        score += (meta.citations.len() as f32 * 0.02).min(0.1);

        score.min(1.0)
    }

    fn extract_citations(&self, text: &str) -> Vec<String> {
        let mut citations = Vec::new();
        for pattern in &self.citations {
            for m in pattern.find_iter(text) {
                let c = m.as_str().trim().to_string();
                if !citations.contains(&c) {
                    citations.push(c);
                }
            }
        }
        citations
    }

    fn extract_date(&self, text: &str) -> Option<NaiveDate> {
        for pattern in &self.dates {
            for caps in pattern.captures_iter(text) {
                let raw = caps.get(1).map(|m| m.as_str())?;
                for format in ["%B %d, %Y", "%Y-%m-%d", "%m/%d/%Y"] {
                    if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
                        return Some(date);
                    }
                }
            }
        }
        None
    }

    fn extract_jurisdiction(&self, text: &str) -> Option<String> {
        for pattern in &self.courts[..3] {
            if pattern.is_match(text) {
                return Some("federal".to_string());
            }
        }
        STATE_NAMES
            .iter()
            .find(|state| text.contains(*state))
            .map(|state| state.to_string())
    }

    fn extract_entities(&self, text: &str) -> Vec<String> {
        let mut entities = Vec::new();
        for pattern in &self.entities {
            for caps in pattern.captures_iter(text) {
                if let Some(m) = caps.get(1) {
                    let e = m.as_str().trim().trim_end_matches(',').to_string();
                    if !e.is_empty() && !entities.contains(&e) {
                        entities.push(e);
                    }
                }
            }
        }
        entities.truncate(20);
        entities
    }

    fn enrich_case_law(&self, text: &str, meta: &mut DocumentMeta) {
        if meta.case_name.is_none() {
            for pattern in &self.case_names {
                if let Some(caps) = pattern.captures(text) {
                    meta.case_name = match (caps.get(1), caps.get(2)) {
                        (Some(a), Some(b)) => {
                            Some(format!("{} v. {}", a.as_str().trim(), b.as_str().trim()))
                        }
                        (Some(a), None) => Some(a.as_str().trim().to_string()),
                        _ => None,
                    };
                    if meta.case_name.is_some() {
                        break;
                    }
                }
            }
        }

        if meta.court.is_none() {
            for pattern in &self.courts {
                if let Some(m) = pattern.find(text) {
                    meta.court = Some(m.as_str().to_string());
                    break;
                }
            }
        }

        let mut judges: Vec<String> = Vec::new();
        for caps in self.judges.captures_iter(text) {
            if let Some(m) = caps.get(1) {
                let j = m.as_str().to_string();
                if !judges.contains(&j) {
                    judges.push(j);
                }
            }
        }
        meta.judges = judges;
    }

    fn enrich_statute(&self, text: &str, meta: &mut DocumentMeta) {
        if meta.statute_title.is_none() {
            if let Some(caps) = self.statute_title.captures(text) {
                let number = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let name = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
                meta.statute_title = Some(if name.is_empty() {
                    number.to_string()
                } else {
                    format!("{} — {}", number, name)
                });
            }
        }
        if meta.effective_date.is_none() {
            if let Some(caps) = self.effective_date.captures(text) {
                meta.effective_date = caps.get(1).map(|m| m.as_str().to_string());
            }
        }
    }

    fn enrich_regulation(&self, text: &str, meta: &mut DocumentMeta) {
        if meta.cfr_reference.is_none() {
            if let Some(caps) = self.cfr.captures(text) {
                let title = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                let part = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                meta.cfr_reference = Some(match caps.get(3) {
                    Some(section) => format!("{} CFR {}.{}", title, part, section.as_str()),
                    None => format!("{} CFR {}", title, part),
                });
            }
        }
        if meta.agency.is_none() {
            for pattern in &self.agency {
                if let Some(caps) = pattern.captures(text) {
                    meta.agency = caps.get(1).map(|m| m.as_str().trim().to_string());
                    break;
                }
            }
        }
    }
}

fn known_collection_type(collection: &str) -> Option<DocumentType> {
    match collection {
        "case_law" => Some(DocumentType::CaseLaw),
        "statutes" => Some(DocumentType::Statute),
        "regulations" => Some(DocumentType::Regulation),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KATZ_EXCERPT: &str = "\
Katz v. United States\n\
Supreme Court of the United States\n\
389 U.S. 347\n\
Decided: December 18, 1967\n\
Justice Stewart delivered the opinion of the Court. The petitioner was \
convicted under an indictment charging him with transmitting wagering \
information by telephone. The Fourth Amendment protects people, not places.";

    #[test]
    fn classifies_case_law_from_indicators() {
        let extractor = MetadataExtractor::new();
        let text = "The plaintiff appealed to the court of appeals. The \
                    defendant argued the opinion in case no 12-345 was wrong.";
        assert_eq!(extractor.classify(text), Some(DocumentType::CaseLaw));
    }

    #[test]
    fn classifies_statute_from_indicators() {
        let extractor = MetadataExtractor::new();
        let text = "Congress enacted the statute as public law 88-352; see \
                    title VII, chapter 21 of the United States Code.";
        assert_eq!(extractor.classify(text), Some(DocumentType::Statute));
    }

    #[test]
    fn weak_legal_signal_classifies_as_web() {
        let extractor = MetadataExtractor::new();
        let text = "This opinion discusses the supreme court briefly.";
        assert_eq!(extractor.classify(text), Some(DocumentType::Web));
    }

    #[test]
    fn non_legal_text_is_rejected() {
        let extractor = MetadataExtractor::new();
        let text = "Chocolate chip cookies require butter, sugar, and flour.";
        assert_eq!(extractor.classify(text), None);
    }

    #[test]
    fn extracts_case_law_metadata() {
        let extractor = MetadataExtractor::new();
        let meta = extractor.extract(KATZ_EXCERPT, DocumentMeta::default(), "case_law");

        assert_eq!(meta.doc_type, Some(DocumentType::CaseLaw));
        assert!(meta
            .case_name
            .as_deref()
            .unwrap()
            .starts_with("Katz v. United States"));
        assert_eq!(
            meta.court.as_deref(),
            Some("Supreme Court of the United States")
        );
        assert!(meta.citations.iter().any(|c| c.contains("389 U.S. 347")));
        assert_eq!(meta.date, NaiveDate::from_ymd_opt(1967, 12, 18));
        assert_eq!(meta.jurisdiction.as_deref(), Some("federal"));
        assert!(meta.judges.contains(&"Stewart".to_string()));
        assert!(meta.content_hash.is_some());
    }

    #[test]
    fn extracts_regulation_metadata() {
        let extractor = MetadataExtractor::new();
        let text = "AGENCY: Environmental Protection Agency\n\
                    This final rule amends 40 CFR 261.4 under the Code of \
                    Federal Regulations as published in the federal register.";
        let meta = extractor.extract(text, DocumentMeta::default(), "regulations");

        assert_eq!(meta.doc_type, Some(DocumentType::Regulation));
        assert_eq!(meta.cfr_reference.as_deref(), Some("40 CFR 261.4"));
        assert_eq!(
            meta.agency.as_deref(),
            Some("Environmental Protection Agency")
        );
    }

    #[test]
    fn quality_score_rewards_rich_case_metadata() {
        let extractor = MetadataExtractor::new();

        let thin = DocumentMeta {
            word_count: 20,
            ..DocumentMeta::default()
        };
        let thin_score = extractor.quality_score(&thin);

        let mut rich = extractor.extract(KATZ_EXCERPT, DocumentMeta::default(), "case_law");
        rich.title = Some("Katz v. United States".to_string());
        rich.word_count = 600;
        let rich_score = extractor.quality_score(&rich);

        assert!(thin_score < 0.2);
        assert!(rich_score > 0.7);
        assert!(rich_score <= 1.0);
    }
}
