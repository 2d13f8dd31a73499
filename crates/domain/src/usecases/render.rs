//! Rendering use case - adapts canonical post text to each destination's budget

use std::collections::HashMap;

use crate::model::Service;
use crate::usecases::normalize::find_urls;

/// Text budget of one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLimits {
    /// Maximum weighted length of one post
    pub max_chars: usize,
    /// Length the destination displays any link as
    pub url_length: usize,
    /// Characters counted wider than one unit, with the extra weight
    pub wide_chars: Vec<(char, usize)>,
}

impl ServiceLimits {
    pub fn for_service(service: Service) -> Self {
        match service {
            Service::Twitter => Self {
                max_chars: 280,
                url_length: 23,
                wide_chars: vec![('•', 1)],
            },
            Service::Mastodon => Self {
                max_chars: 500,
                url_length: 23,
                wide_chars: vec![],
            },
            Service::Bluesky => Self {
                max_chars: 300,
                url_length: 29,
                wide_chars: vec![],
            },
        }
    }

    /// Length of `text` as counted by the destination
    pub fn weighted_len(&self, text: &str) -> usize {
        text.chars()
            .map(|c| {
                1 + self
                    .wide_chars
                    .iter()
                    .find(|(wide, _)| *wide == c)
                    .map_or(0, |(_, extra)| *extra)
            })
            .sum()
    }
}

/// Split granularity, coarsest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Paragraph,
    Sentence,
    Clause,
    Word,
    Character,
}

impl Level {
    fn finer(self) -> Option<Level> {
        match self {
            Level::Paragraph => Some(Level::Sentence),
            Level::Sentence => Some(Level::Clause),
            Level::Clause => Some(Level::Word),
            Level::Word => Some(Level::Character),
            Level::Character => None,
        }
    }

    fn separator(self) -> &'static str {
        match self {
            Level::Paragraph => "\n",
            Level::Character => "",
            _ => " ",
        }
    }

    fn pieces(self, text: &str) -> Vec<String> {
        match self {
            Level::Paragraph => text
                .split('\n')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            Level::Sentence => split_after(text, &['.', '!', '?']),
            Level::Clause => split_after(text, &[',', ':']),
            Level::Word => text.split_whitespace().map(str::to_string).collect(),
            Level::Character => text.chars().map(String::from).collect(),
        }
    }
}

/// Split after any of `marks` when followed by whitespace; the whitespace is consumed
fn split_after(text: &str, marks: &[char]) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if marks.contains(&c) && chars.peek().is_some_and(|n| n.is_whitespace()) {
            while chars.peek().is_some_and(|n| n.is_whitespace()) {
                chars.next();
            }
            pieces.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Split `text` into chunks that each fit `limits`, degrading from paragraphs
/// down to single characters only where a coarser split does not fit
pub fn split_text(text: &str, limits: &ServiceLimits) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }

    // Long links count as url_length; stand-ins of that length keep them whole
    let mut placeholders = Vec::new();
    let mut encoded = text.to_string();
    for (i, url) in find_urls(text).into_iter().enumerate() {
        if url.chars().count() <= limits.url_length {
            continue;
        }
        let prefix: String = url.chars().take(limits.url_length.saturating_sub(3)).collect();
        let placeholder = format!("{:02}_{}", i, prefix);
        encoded = encoded.replacen(&url, &placeholder, 1);
        placeholders.push((placeholder, url));
    }

    let chunks = if limits.weighted_len(&encoded) <= limits.max_chars {
        vec![encoded]
    } else {
        split_level(&encoded, Level::Paragraph, limits)
    };

    chunks
        .into_iter()
        .map(|chunk| {
            placeholders
                .iter()
                .fold(chunk, |acc, (placeholder, url)| acc.replacen(placeholder, url, 1))
        })
        .collect()
}

fn split_level(text: &str, level: Level, limits: &ServiceLimits) -> Vec<String> {
    let separator = level.separator();
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in level.pieces(text) {
        if limits.weighted_len(&piece) > limits.max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            match level.finer() {
                Some(finer) => chunks.extend(split_level(&piece, finer, limits)),
                None => chunks.push(piece),
            }
            continue;
        }

        let candidate = if current.is_empty() {
            piece.clone()
        } else {
            format!("{}{}{}", current, separator, piece)
        };
        if limits.weighted_len(&candidate) <= limits.max_chars {
            current = candidate;
        } else {
            chunks.push(std::mem::replace(&mut current, piece));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Configuration for the renderer
#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub limits: HashMap<Service, ServiceLimits>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            limits: Service::ALL
                .iter()
                .map(|&s| (s, ServiceLimits::for_service(s)))
                .collect(),
        }
    }
}

/// Renderer for per-destination post text
pub struct Renderer {
    config: RenderConfig,
}

impl Renderer {
    pub fn new(config: RenderConfig) -> Self {
        Self { config }
    }

    pub fn limits(&self, service: Service) -> ServiceLimits {
        self.config
            .limits
            .get(&service)
            .cloned()
            .unwrap_or_else(|| ServiceLimits::for_service(service))
    }

    /// Chunks to publish on `service`, in thread order
    pub fn chunks(&self, text: &str, service: Service) -> Vec<String> {
        split_text(text, &self.limits(service))
    }
}
