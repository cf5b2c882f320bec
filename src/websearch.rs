//! Web search against authorized legal sources.
//!
//! Issues a query to the configured search provider, discards every result
//! URL that is not on the authorized-domain allow-list (checked before any
//! fetch), scrapes the surviving pages, classifies them into the document
//! taxonomy, and hands accepted documents to the ingestion pipeline.
//!
//! On provider failure or zero authorized results, a small built-in set of
//! fallback documents matching the query's detected legal topic is pushed
//! through the pipeline instead, so downstream synthesis always has some
//! grounding material. That availability-over-freshness tradeoff is
//! deliberate.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::config::WebSearchConfig;
use crate::extract;
use crate::models::{Document, WebSearchStats};
use crate::pipeline::{DataPipeline, ProcessOutcome, RawSource};

// ============ Domain allow-list ============

/// Hand-authored list of web domains approved for legal research scraping.
pub struct DomainAllowList {
    domains: Vec<String>,
}

impl DomainAllowList {
    /// The built-in legal sources, used when no override file is given.
    pub fn default_list() -> Self {
        let domains = [
            "scholar.google.com",
            "caselaw.findlaw.com",
            "supreme.justia.com",
            "law.cornell.edu",
            "law.justia.com",
            "courtlistener.com",
            "leagle.com",
            "casetext.com",
            "govinfo.gov",
            "congress.gov",
            "uscourts.gov",
            "federalregister.gov",
            "supremecourt.gov",
            "justice.gov",
            "findlaw.com",
            "hud.gov",
            "dol.gov",
            "eeoc.gov",
        ]
        .iter()
        .map(|d| d.to_string())
        .collect();
        Self { domains }
    }

    /// Load one domain per line; `#` lines are comments.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read authorized domains: {}", path.display()))?;
        let domains: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| l.to_ascii_lowercase())
            .collect();
        if domains.is_empty() {
            bail!("Authorized domain list {} is empty", path.display());
        }
        Ok(Self { domains })
    }

    pub fn load(config: &WebSearchConfig) -> Result<Self> {
        match &config.authorized_domains_path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default_list()),
        }
    }

    /// True when the URL's host is an authorized domain or a subdomain of
    /// one. Anything unparseable is unauthorized.
    pub fn is_authorized(&self, url: &str) -> bool {
        let host = match reqwest::Url::parse(url) {
            Ok(parsed) => match parsed.host_str() {
                Some(h) => h.to_ascii_lowercase(),
                None => return false,
            },
            Err(_) => return false,
        };
        self.domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)))
    }
}

// ============ Search providers ============

/// One result from a search provider, before authorization filtering.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// A remote web-search capability.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>>;
}

/// Search provider backed by the SerpAPI JSON endpoint.
///
/// Requires the `SERPAPI_KEY` environment variable.
pub struct SerpApiProvider {
    api_key: String,
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl SerpApiProvider {
    pub fn new(config: &WebSearchConfig) -> Result<Self> {
        let api_key = std::env::var("SERPAPI_KEY")
            .context("SERPAPI_KEY environment variable not set")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()?;
        Ok(Self {
            api_key,
            client,
            backoff: BackoffPolicy::new(2),
        })
    }
}

#[async_trait]
impl SearchProvider for SerpApiProvider {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        let mut last_err = None;

        for attempt in 0..=self.backoff.max_retries {
            self.backoff.wait(attempt).await;

            let resp = self
                .client
                .get("https://serpapi.com/search")
                .query(&[
                    ("q", query),
                    ("api_key", self.api_key.as_str()),
                    ("num", &max_results.to_string()),
                ])
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return Ok(parse_serpapi_results(&json));
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("Search API error {}", status));
                        continue;
                    }
                    let body = response.text().await.unwrap_or_default();
                    bail!("Search API error {}: {}", status, body);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Search failed after retries")))
    }
}

fn parse_serpapi_results(json: &serde_json::Value) -> Vec<SearchHit> {
    json.get("organic_results")
        .and_then(|r| r.as_array())
        .map(|results| {
            results
                .iter()
                .filter_map(|result| {
                    let url = result.get("link").and_then(|l| l.as_str())?;
                    Some(SearchHit {
                        title: result
                            .get("title")
                            .and_then(|t| t.as_str())
                            .unwrap_or("Untitled")
                            .to_string(),
                        url: url.to_string(),
                        snippet: result
                            .get("snippet")
                            .and_then(|s| s.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

// ============ Module ============

/// Web search, scrape, classify, and pipeline hand-off.
pub struct WebSearchModule {
    provider: Arc<dyn SearchProvider>,
    allowlist: Arc<DomainAllowList>,
    pipeline: Arc<DataPipeline>,
    client: reqwest::Client,
    max_depth: usize,
    href: Regex,
}

impl WebSearchModule {
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        allowlist: Arc<DomainAllowList>,
        pipeline: Arc<DataPipeline>,
        config: &WebSearchConfig,
    ) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .user_agent("Mozilla/5.0 (compatible; lexrag/0.3)")
            .build()?;
        Ok(Arc::new(Self {
            provider,
            allowlist,
            pipeline,
            client,
            max_depth: config.max_depth,
            href: Regex::new(r#"href\s*=\s*["']([^"'#]+)["']"#).expect("href pattern"),
        }))
    }

    pub fn allowlist(&self) -> Arc<DomainAllowList> {
        Arc::clone(&self.allowlist)
    }

    /// Search, fetch, classify, and ingest. Returns the accepted documents
    /// and run statistics.
    ///
    /// With `collection = None` classification decides each document's
    /// destination; a pinned collection always wins. Every returned
    /// document has already been added to the engine; callers must still
    /// force a flush before treating them as durable.
    pub async fn search_and_process(
        &self,
        query: &str,
        collection: Option<&str>,
        max_results: usize,
        follow_links: bool,
    ) -> Result<(Vec<Arc<Document>>, WebSearchStats)> {
        let mut stats = WebSearchStats::default();

        // Over-fetch so the allow-list filter still leaves enough results.
        let hits = match self.provider.search(query, max_results * 3).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "search provider failed, using fallback documents");
                let documents = self.fallback_documents(query, &mut stats).await;
                return Ok((documents, stats));
            }
        };

        stats.urls_found = hits.len();
        let authorized: Vec<SearchHit> = hits
            .into_iter()
            .filter(|hit| self.allowlist.is_authorized(&hit.url))
            .take(max_results)
            .collect();
        stats.urls_authorized = authorized.len();

        let mut documents = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = authorized
            .iter()
            .map(|hit| (hit.url.clone(), 1))
            .collect();
        // Hard cap on total fetches, independent of link fan-out.
        let fetch_budget = max_results * 4;

        while let Some((url, depth)) = queue.pop_front() {
            if stats.pages_fetched + stats.pages_failed >= fetch_budget {
                break;
            }
            if !visited.insert(url.clone()) {
                continue;
            }

            let page = match self.fetch_page(&url).await {
                Ok(page) => {
                    stats.pages_fetched += 1;
                    page
                }
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "page fetch failed");
                    stats.pages_failed += 1;
                    continue;
                }
            };

            if follow_links && depth < self.max_depth {
                for link in self.extract_links(&url, &page.html) {
                    if self.allowlist.is_authorized(&link) && !visited.contains(&link) {
                        queue.push_back((link, depth + 1));
                    }
                }
            }

            let raw = RawSource {
                name: url.clone(),
                text: page.text,
                title: page.title,
                source_url: Some(url.clone()),
            };
            match self.pipeline.process_raw(raw, collection).await {
                Ok(ProcessOutcome::Accepted(doc)) => {
                    stats.documents_processed += 1;
                    documents.push(doc);
                }
                Ok(ProcessOutcome::Rejected(reason)) => {
                    tracing::debug!(url = %url, reason = %reason, "page not ingested");
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "page processing failed");
                }
            }
        }

        if documents.is_empty() {
            tracing::info!(query, "no authorized web documents, using fallback documents");
            let fallback = self.fallback_documents(query, &mut stats).await;
            return Ok((fallback, stats));
        }

        Ok((documents, stats))
    }

    async fn fetch_page(&self, url: &str) -> Result<FetchedPage> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            bail!("HTTP {}", resp.status());
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.contains("application/pdf") {
            let bytes = resp.bytes().await?;
            let extracted = extract::extract_bytes(&bytes, extract::SourceFormat::Pdf)
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            return Ok(FetchedPage {
                text: extracted.text,
                title: None,
                html: String::new(),
            });
        }

        if !content_type.contains("text/html") && !content_type.is_empty() {
            bail!("unsupported content type: {}", content_type);
        }

        let html = resp.text().await?;
        let extracted = extract::extract_html(&html);
        Ok(FetchedPage {
            text: extracted.text,
            title: extracted.title,
            html,
        })
    }

    fn extract_links(&self, base: &str, html: &str) -> Vec<String> {
        let base_url = match reqwest::Url::parse(base) {
            Ok(u) => u,
            Err(_) => return Vec::new(),
        };
        self.href
            .captures_iter(html)
            .filter_map(|caps| caps.get(1))
            .filter_map(|m| base_url.join(m.as_str()).ok())
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .map(|u| u.to_string())
            .collect()
    }

    /// Push the built-in primers for the query's detected topic through
    /// the pipeline. Classification decides their collections like any
    /// other web document.
    async fn fallback_documents(
        &self,
        query: &str,
        stats: &mut WebSearchStats,
    ) -> Vec<Arc<Document>> {
        stats.fallback_used = true;
        let mut documents = Vec::new();

        for primer in fallback_primers(query) {
            let raw = RawSource {
                name: primer.url.to_string(),
                text: primer.text.to_string(),
                title: Some(primer.title.to_string()),
                source_url: Some(primer.url.to_string()),
            };
            match self.pipeline.process_raw(raw, None).await {
                Ok(ProcessOutcome::Accepted(doc)) => {
                    stats.documents_processed += 1;
                    documents.push(doc);
                }
                Ok(ProcessOutcome::Rejected(reason)) => {
                    tracing::warn!(primer = primer.title, reason = %reason, "fallback primer rejected");
                }
                Err(e) => {
                    tracing::warn!(primer = primer.title, error = %e, "fallback primer failed");
                }
            }
        }

        documents
    }
}

struct FetchedPage {
    text: String,
    title: Option<String>,
    html: String,
}

// ============ Fallback primers ============

struct Primer {
    title: &'static str,
    url: &'static str,
    text: &'static str,
}

/// Select built-in fallback documents for the query's legal topic.
fn fallback_primers(query: &str) -> Vec<Primer> {
    let q = query.to_lowercase();

    if ["tenant", "landlord", "housing", "eviction", "lease", "rent"]
        .iter()
        .any(|k| q.contains(k))
    {
        return vec![
            Primer {
                title: "Fair Housing Act, 42 U.S.C. § 3604",
                url: "https://www.law.cornell.edu/uscode/text/42/3604",
                text: FAIR_HOUSING_PRIMER,
            },
            Primer {
                title: "Implied Warranty of Habitability",
                url: "https://www.law.cornell.edu/wex/implied_warranty_of_habitability",
                text: HABITABILITY_PRIMER,
            },
        ];
    }

    if ["privacy", "search", "seizure", "fourth amendment", "surveillance"]
        .iter()
        .any(|k| q.contains(k))
    {
        return vec![Primer {
            title: "Fourth Amendment and Katz v. United States",
            url: "https://www.law.cornell.edu/constitution/fourth_amendment",
            text: FOURTH_AMENDMENT_PRIMER,
        }];
    }

    if ["speech", "first amendment", "religion", "press"]
        .iter()
        .any(|k| q.contains(k))
    {
        return vec![Primer {
            title: "First Amendment",
            url: "https://www.law.cornell.edu/constitution/first_amendment",
            text: FIRST_AMENDMENT_PRIMER,
        }];
    }

    if ["employment", "discrimination", "workplace", "wage", "fired"]
        .iter()
        .any(|k| q.contains(k))
    {
        return vec![Primer {
            title: "Title VII of the Civil Rights Act of 1964",
            url: "https://www.law.cornell.edu/uscode/text/42/2000e-2",
            text: TITLE_VII_PRIMER,
        }];
    }

    if ["due process", "equal protection", "fourteenth amendment"]
        .iter()
        .any(|k| q.contains(k))
    {
        return vec![Primer {
            title: "Fourteenth Amendment: Due Process and Equal Protection",
            url: "https://www.law.cornell.edu/constitution/amendmentxiv",
            text: FOURTEENTH_AMENDMENT_PRIMER,
        }];
    }

    vec![Primer {
        title: "Constitutional Law Overview",
        url: "https://www.law.cornell.edu/wex/constitutional_law",
        text: CONSTITUTIONAL_LAW_PRIMER,
    }]
}

const FAIR_HOUSING_PRIMER: &str = "\
The Fair Housing Act is a federal statute enacted by Congress as Title VIII \
of the Civil Rights Act of 1968 and codified in the United States Code at \
42 U.S.C. § 3604. Under the statute, it is unlawful to refuse to sell or \
rent a dwelling to any person because of race, color, religion, sex, \
familial status, or national origin. The statute also makes it unlawful to \
discriminate in the terms, conditions, or privileges of rental of a \
dwelling. Each section of the chapter sets out prohibited conduct, and the \
statute authorizes civil actions for violations. Familial status \
protections extend to tenants with children under eighteen. State statutes \
commonly extend these protections further, and many jurisdictions have \
enacted additional tenant-protection legislation under their own codes.";

const HABITABILITY_PRIMER: &str = "\
The implied warranty of habitability is a doctrine under which every \
residential lease is deemed to include a promise that the premises are fit \
for human habitation. Most states have enacted landlord-tenant statutes \
codifying the warranty in their codes: each such statute requires the \
landlord to maintain the dwelling in compliance with housing codes, keep \
common areas safe, and supply essential services such as heat and running \
water. Under these enacted sections, a tenant confronted with serious \
defects may generally notify the landlord, and if repairs are not made \
within the statutory period, pursue remedies the legislation provides, \
including repair-and-deduct, rent withholding, or lease termination. The \
statute of the relevant state and chapter governs the available remedies \
and required notice.";

const FOURTH_AMENDMENT_PRIMER: &str = "\
The Fourth Amendment to the United States Constitution protects the right \
of the people to be secure in their persons, houses, papers, and effects \
against unreasonable searches and seizures. In Katz v. United States, \
389 U.S. 347, the Supreme Court held that the Fourth Amendment protects \
people, not places, and that the government's warrantless wiretapping of a \
public telephone booth violated a reasonable expectation of privacy. The \
opinion established the two-part test later refined by the court: whether \
the person exhibited an actual expectation of privacy, and whether that \
expectation is one society recognizes as reasonable. A defendant moving to \
suppress evidence bears the burden of establishing a legitimate \
expectation of privacy in the place searched.";

const FIRST_AMENDMENT_PRIMER: &str = "\
The First Amendment to the United States Constitution prohibits Congress \
from making any law respecting an establishment of religion, or \
prohibiting the free exercise thereof, or abridging the freedom of speech \
or of the press. In Cohen v. California, 403 U.S. 15, the Supreme Court \
reversed a conviction for offensive conduct, with the opinion holding that \
the state could not criminalize the public display of a single expletive \
absent a showing of incitement. Content-based restrictions on speech are \
presumptively invalid and reviewed under strict scrutiny, while reasonable \
time, place, and manner restrictions are permitted when they are \
content-neutral, narrowly tailored, and leave open ample alternative \
channels of communication. The appellant in such cases must show state \
action restricting protected expression.";

const TITLE_VII_PRIMER: &str = "\
Title VII of the Civil Rights Act of 1964 is a federal statute enacted by \
Congress and codified in the United States Code at 42 U.S.C. § 2000e-2. \
Under the statute it is an unlawful employment practice for an employer to \
fail or refuse to hire or to discharge any individual, or otherwise to \
discriminate with respect to compensation, terms, conditions, or \
privileges of employment, because of race, color, religion, sex, or \
national origin. The chapter covers employers with fifteen or more \
employees. Before filing suit under the statute, a charging party must \
exhaust administrative remedies by filing a timely charge, and each \
section prescribes the applicable deadlines. Congress has amended the \
legislation several times, including the enacted damages provisions of \
the Civil Rights Act of 1991.";

const FOURTEENTH_AMENDMENT_PRIMER: &str = "\
The Fourteenth Amendment to the United States Constitution provides that \
no state shall deprive any person of life, liberty, or property without \
due process of law, nor deny to any person within its jurisdiction the \
equal protection of the laws. In Brown v. Board of Education, 347 U.S. \
483, the Supreme Court held that separate educational facilities are \
inherently unequal, and the opinion rejected the doctrine announced in \
earlier precedent. Due process doctrine divides into procedural due \
process, which requires notice and an opportunity to be heard before a \
deprivation, and substantive due process, which protects certain \
fundamental rights from government interference regardless of the \
procedures used. Equal protection claims are reviewed under tiers of \
scrutiny keyed to the classification drawn by the challenged law.";

const CONSTITUTIONAL_LAW_PRIMER: &str = "\
Constitutional law governs the interpretation and implementation of the \
United States Constitution, the structure of the federal government, and \
the rights the document secures against government action. The Supreme \
Court's opinion in Marbury v. Madison, 5 U.S. 137, established judicial \
review, under which courts may hold legislation enacted by Congress \
unconstitutional. Core doctrines include separation of powers, \
federalism and the allocation of authority between the United States and \
the several states, and the incorporation of most provisions of the Bill \
of Rights against the states through the Fourteenth Amendment. A litigant \
challenging government conduct must establish standing: an injury in \
fact, causation, and redressability. Each clause of the Constitution has \
generated its own body of precedent and opinion.";
