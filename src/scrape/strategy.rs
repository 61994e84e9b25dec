use scraper::{ElementRef, Html, Selector};

use super::MIN_ABSTRACT_CHARS;

/// Locates an abstract inside fetched page markup.
pub trait AbstractStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn extract(&self, markup: &str) -> Option<String>;
}

fn compile(css: &[&str]) -> Vec<Selector> {
    css.iter()
        .filter_map(|s| match Selector::parse(s) {
            Ok(sel) => Some(sel),
            Err(e) => {
                tracing::warn!("Skipping invalid selector {:?}: {:?}", s, e);
                None
            }
        })
        .collect()
}

/// Whitespace-collapsed text content of an element.
fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drop a leading "Abstract" / "Abstract:" label, leaving words like "Abstraction" alone.
fn strip_label(text: &str) -> &str {
    let trimmed = text.trim_start();
    if let Some(head) = trimmed.get(..8) {
        if head.eq_ignore_ascii_case("abstract") {
            let rest = &trimmed[8..];
            if rest.is_empty() || rest.starts_with(':') || rest.starts_with(char::is_whitespace) {
                return rest.trim_start_matches(':').trim_start();
            }
        }
    }
    trimmed
}

/// Publisher strategy: tries a fixed list of layout anchors in priority order
/// and returns the first one that has text.
pub struct SelectorStrategy {
    name: &'static str,
    selectors: Vec<Selector>,
}

impl SelectorStrategy {
    pub fn new(name: &'static str, css: &[&str]) -> Self {
        Self { name, selectors: compile(css) }
    }

    pub fn arxiv() -> Self {
        Self::new("arxiv", &["blockquote.abstract"])
    }

    pub fn pubmed() -> Self {
        Self::new("pubmed", &["div.abstract-content", "div#abstract"])
    }

    pub fn ieee() -> Self {
        Self::new("ieee", &["div.abstract-text", "div.u-mb-1"])
    }

    pub fn acm() -> Self {
        Self::new("acm", &["div.abstractSection", r#"div[role="paragraph"]"#])
    }

    pub fn springer() -> Self {
        Self::new(
            "springer",
            &[
                "div.c-article-section__content",
                r#"section[data-title="Abstract"]"#,
            ],
        )
    }
}

impl AbstractStrategy for SelectorStrategy {
    fn name(&self) -> &str {
        self.name
    }

    fn extract(&self, markup: &str) -> Option<String> {
        let document = Html::parse_document(markup);
        self.selectors.iter().find_map(|sel| {
            let el = document.select(sel).next()?;
            let text = element_text(el);
            let text = strip_label(&text);
            (!text.is_empty()).then(|| text.to_string())
        })
    }
}

enum Anchor {
    /// `content` attribute of a `<meta>` tag.
    Meta(Selector),
    Element(Selector),
}

/// Fallback for unknown sites: description metadata first, then the
/// containers academic sites commonly put abstracts in.
pub struct GenericStrategy {
    anchors: Vec<Anchor>,
}

impl GenericStrategy {
    pub fn new() -> Self {
        let meta = compile(&[
            r#"meta[name="description"]"#,
            r#"meta[property="og:description"]"#,
        ]);
        let elements = compile(&[
            "div.abstract",
            "section#abstract",
            "div#abstract",
            "p.abstract",
        ]);
        Self {
            anchors: meta
                .into_iter()
                .map(Anchor::Meta)
                .chain(elements.into_iter().map(Anchor::Element))
                .collect(),
        }
    }
}

impl Default for GenericStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl AbstractStrategy for GenericStrategy {
    fn name(&self) -> &str {
        "generic"
    }

    fn extract(&self, markup: &str) -> Option<String> {
        let document = Html::parse_document(markup);
        self.anchors.iter().find_map(|anchor| {
            let text = match anchor {
                Anchor::Meta(sel) => {
                    let el = document.select(sel).next()?;
                    let content = el.value().attr("content")?;
                    content.split_whitespace().collect::<Vec<_>>().join(" ")
                }
                Anchor::Element(sel) => element_text(document.select(sel).next()?),
            };
            let text = strip_label(&text);
            (text.chars().count() >= MIN_ABSTRACT_CHARS).then(|| text.to_string())
        })
    }
}

struct Route {
    host_patterns: &'static [&'static str],
    strategy: Box<dyn AbstractStrategy>,
}

/// Maps link hosts to extraction strategies; unmatched hosts get the fallback.
pub struct StrategyRegistry {
    routes: Vec<Route>,
    fallback: Box<dyn AbstractStrategy>,
}

impl StrategyRegistry {
    pub fn new(fallback: Box<dyn AbstractStrategy>) -> Self {
        Self { routes: Vec::new(), fallback }
    }

    /// Route hosts containing any of `host_patterns` to `strategy`.
    /// Earlier registrations win.
    pub fn register(
        mut self,
        host_patterns: &'static [&'static str],
        strategy: Box<dyn AbstractStrategy>,
    ) -> Self {
        self.routes.push(Route { host_patterns, strategy });
        self
    }

    pub fn for_host(&self, host: &str) -> &dyn AbstractStrategy {
        let host = host.to_lowercase();
        self.routes
            .iter()
            .find(|r| r.host_patterns.iter().any(|p| host.contains(p)))
            .map(|r| r.strategy.as_ref())
            .unwrap_or(self.fallback.as_ref())
    }

    pub fn for_url(&self, url: &str) -> &dyn AbstractStrategy {
        match reqwest::Url::parse(url) {
            Ok(parsed) => self.for_host(parsed.host_str().unwrap_or("")),
            Err(_) => self.fallback.as_ref(),
        }
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new(Box::new(GenericStrategy::new()))
            .register(&["arxiv.org"], Box::new(SelectorStrategy::arxiv()))
            .register(&["pubmed", "ncbi.nlm.nih.gov"], Box::new(SelectorStrategy::pubmed()))
            .register(&["ieee"], Box::new(SelectorStrategy::ieee()))
            .register(&["acm.org"], Box::new(SelectorStrategy::acm()))
            .register(&["springer"], Box::new(SelectorStrategy::springer()))
    }
}
