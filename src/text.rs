//! Text tools: case conversion, templated suggestions and resume layout
//!
//! Generators draw from a seeded [`StdRng`]; the seed is echoed in the result so
//! the same suggestions can be reproduced later.

use async_trait::async_trait;
use lopdf::content::{Content, Operation as PdfOp};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::handler::{run_blocking, HandlerOutput, ProcessingJob, ToolHandler};
use crate::pdf::{latin1, save_pdf};
use crate::registry::{Operation, TextOperation, ToolCategory};

const NAME_PREFIXES: &[&str] = &["Pro", "Smart", "Digital", "Tech", "Expert", "Prime", "Elite", "Ultra"];
const NAME_SUFFIXES: &[&str] = &["Solutions", "Services", "Pro", "Hub", "Lab", "Studio", "Works", "Co"];

const PROFESSIONAL_TITLES: &[&str] = &[
    "Complete Guide to {keyword}",
    "Best Practices for {keyword}",
    "How to Master {keyword} in 2024",
    "Top 10 {keyword} Tips",
    "Understanding {keyword}: A Comprehensive Overview",
];
const CASUAL_TITLES: &[&str] = &[
    "Everything You Need to Know About {keyword}",
    "Why {keyword} Matters More Than You Think",
    "The Ultimate {keyword} Hack",
    "Simple {keyword} Tips That Actually Work",
    "What I Learned About {keyword}",
];

const DESCRIPTION_OPENINGS: &[&str] = &[
    "Introducing {product}, the revolutionary solution designed for {audience}.",
    "Meet {product}, built from the ground up for {audience}.",
    "{product} gives {audience} everything they need in one place.",
    "Say hello to {product}, made for {audience} who expect more.",
];
const DESCRIPTION_CLOSINGS: &[&str] = &[
    "Whether you're looking to streamline your workflow or enhance productivity, {product} provides the tools you need to succeed.",
    "Perfect for businesses and individuals who demand quality and efficiency. Experience the difference that {product} can make in your daily operations.",
    "It combines cutting-edge technology with practical design, so {product} delivers exceptional results from day one.",
];
const DEFAULT_FEATURES: &[&str] = &["Advanced functionality", "User-friendly interface", "Reliable performance"];
const DEFAULT_AUDIENCE: &str = "modern professionals";

/// Draws per requested suggestion before giving up on filling `count` unique ones
const ATTEMPTS_PER_SUGGESTION: usize = 10;

fn industry_terms(industry: &str) -> &'static [&'static str] {
    match industry {
        "technology" => &["Tech", "Digital", "Cyber", "Data", "Cloud", "AI"],
        "healthcare" => &["Health", "Care", "Medical", "Wellness", "Life"],
        "finance" => &["Finance", "Capital", "Money", "Wealth", "Investment"],
        "education" => &["Learn", "Edu", "Academic", "Study", "Knowledge"],
        _ => &["Pro", "Smart", "Expert", "Prime", "Elite"],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextCase {
    Upper,
    Lower,
    Title,
    Sentence,
    Toggle,
}

impl TextCase {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "upper" => Ok(TextCase::Upper),
            "lower" => Ok(TextCase::Lower),
            "title" => Ok(TextCase::Title),
            "sentence" => Ok(TextCase::Sentence),
            "toggle" => Ok(TextCase::Toggle),
            other => Err(PipelineError::invalid(format!("Unknown case '{}'", other))),
        }
    }

    pub fn apply(&self, text: &str) -> String {
        match self {
            TextCase::Upper => text.to_uppercase(),
            TextCase::Lower => text.to_lowercase(),
            TextCase::Title => title_case(text),
            TextCase::Sentence => sentence_case(text),
            TextCase::Toggle => text
                .chars()
                .flat_map(|c| {
                    if c.is_uppercase() {
                        c.to_lowercase().collect::<Vec<_>>()
                    } else {
                        c.to_uppercase().collect::<Vec<_>>()
                    }
                })
                .collect(),
        }
    }
}

/// Every letter run starts upper case, the rest of the run is lower case.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = c == '\'' && in_word;
        }
    }
    out
}

fn sentence_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut capitalize = true;
    let mut after_terminator = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if capitalize {
                out.extend(c.to_uppercase());
                capitalize = false;
            } else {
                out.extend(c.to_lowercase());
            }
            after_terminator = false;
        } else {
            out.push(c);
            if matches!(c, '.' | '!' | '?') {
                after_terminator = true;
            } else if c.is_whitespace() && after_terminator {
                capitalize = true;
            } else if !c.is_whitespace() {
                after_terminator = false;
            }
        }
    }
    out
}

/// First character upper case, remainder lower case.
fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn keyword_list(keywords: &str) -> Result<Vec<String>> {
    let list: Vec<String> = keywords
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect();
    if list.is_empty() {
        return Err(PipelineError::invalid("At least one keyword is required"));
    }
    Ok(list)
}

fn pick<'a, R: Rng>(items: &'a [impl AsRef<str>], rng: &mut R) -> &'a str {
    items.choose(rng).map(|s| s.as_ref()).unwrap_or_default()
}

fn collect_unique<R, F>(count: usize, rng: &mut R, mut draw: F) -> Vec<String>
where
    R: Rng,
    F: FnMut(&mut R) -> String,
{
    let mut out: Vec<String> = Vec::with_capacity(count);
    for _ in 0..count * ATTEMPTS_PER_SUGGESTION {
        if out.len() == count {
            break;
        }
        let candidate = draw(rng);
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    }
    out
}

pub fn business_names<R: Rng>(keywords: &str, industry: &str, count: usize, rng: &mut R) -> Result<Vec<String>> {
    let keywords: Vec<String> = keyword_list(keywords)?.iter().map(|k| capitalize(k)).collect();
    let terms = industry_terms(industry);

    Ok(collect_unique(count, rng, |rng| match rng.random_range(0..4) {
        0 => format!("{} {}", pick(NAME_PREFIXES, rng), pick(&keywords, rng)),
        1 => format!("{} {}", pick(&keywords, rng), pick(NAME_SUFFIXES, rng)),
        2 => format!("{} {}", pick(terms, rng), pick(&keywords, rng)),
        _ => format!(
            "{} {} {}",
            pick(&keywords, rng),
            pick(terms, rng),
            pick(NAME_SUFFIXES, rng)
        ),
    }))
}

pub fn blog_titles<R: Rng>(keywords: &str, tone: &str, count: usize, rng: &mut R) -> Result<Vec<String>> {
    let keywords = keyword_list(keywords)?;
    let templates = if tone == "casual" { CASUAL_TITLES } else { PROFESSIONAL_TITLES };

    Ok(collect_unique(count, rng, |rng| {
        let template = pick(templates, rng);
        template.replace("{keyword}", pick(&keywords, rng))
    }))
}

/// Marketing copy: an opening line, the feature list, and a closing pitch.
pub fn product_description<R: Rng>(
    product: &str,
    features: &[String],
    audience: &str,
    rng: &mut R,
) -> Result<String> {
    let product = product.trim();
    if product.is_empty() {
        return Err(PipelineError::invalid("A product name is required"));
    }
    let audience = match audience.trim() {
        "" => DEFAULT_AUDIENCE,
        given => given,
    };
    let listed: Vec<&str> = features.iter().map(|f| f.trim()).filter(|f| !f.is_empty()).collect();
    let listed = if listed.is_empty() { DEFAULT_FEATURES.to_vec() } else { listed };

    let fill = |template: &str| template.replace("{product}", product).replace("{audience}", audience);
    let mut text = fill(pick(DESCRIPTION_OPENINGS, rng));
    text.push_str("\n\nKey Features:\n");
    for feature in listed {
        text.push_str("\u{2022} ");
        text.push_str(feature);
        text.push('\n');
    }
    text.push('\n');
    text.push_str(&fill(pick(DESCRIPTION_CLOSINGS, rng)));
    Ok(text)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResumeForm {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub objective: String,
    pub experience: Vec<ExperienceEntry>,
    pub education: Vec<EducationEntry>,
    pub skills: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExperienceEntry {
    pub position: String,
    pub company: String,
    pub duration: String,
    pub description: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EducationEntry {
    pub degree: String,
    pub institution: String,
    pub year: String,
    pub grade: String,
}

/// "a - b" with empty sides dropped
fn joined(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" - ")
}

const PAGE_WIDTH: f32 = 612.0;
const PAGE_HEIGHT: f32 = 792.0;
const MARGIN: f32 = 50.0;

#[derive(Debug, Clone, Copy)]
enum Face {
    Regular,
    Bold,
}

impl Face {
    fn resource(&self) -> &'static [u8] {
        match self {
            Face::Regular => b"F1",
            Face::Bold => b"F2",
        }
    }
}

/// Greedy word wrap sized for Helvetica's average glyph width.
fn wrap(text: &str, font_size: f32) -> Vec<String> {
    let max_chars = (((PAGE_WIDTH - 2.0 * MARGIN) / (font_size * 0.5)) as usize).max(8);
    let mut lines = Vec::new();
    let mut line = String::new();
    for word in text.split_whitespace() {
        let mut word = word.to_string();
        while word.chars().count() > max_chars {
            let head: String = word.chars().take(max_chars).collect();
            word = word.chars().skip(max_chars).collect();
            if !line.is_empty() {
                lines.push(std::mem::take(&mut line));
            }
            lines.push(head);
        }
        if !line.is_empty() && line.chars().count() + 1 + word.chars().count() > max_chars {
            lines.push(std::mem::take(&mut line));
        }
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(&word);
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

struct ResumeLayout {
    pages: Vec<Vec<PdfOp>>,
    y: f32,
}

impl ResumeLayout {
    fn new() -> Self {
        Self {
            pages: vec![Vec::new()],
            y: PAGE_HEIGHT - MARGIN,
        }
    }

    fn text(&mut self, face: Face, size: f32, text: &str, advance: f32) {
        for line in wrap(text, size) {
            if self.y - size < MARGIN {
                self.pages.push(Vec::new());
                self.y = PAGE_HEIGHT - MARGIN;
            }
            self.y -= size;
            let ops = [
                PdfOp::new("BT", vec![]),
                PdfOp::new("Tf", vec![Object::Name(face.resource().to_vec()), size.into()]),
                PdfOp::new("Td", vec![MARGIN.into(), self.y.into()]),
                PdfOp::new("Tj", vec![Object::string_literal(latin1(&line))]),
                PdfOp::new("ET", vec![]),
            ];
            if let Some(page) = self.pages.last_mut() {
                page.extend(ops);
            }
            self.y -= advance;
        }
    }

    fn gap(&mut self, amount: f32) {
        self.y -= amount;
    }

    fn heading(&mut self, title: &str) {
        self.gap(12.0);
        self.text(Face::Bold, 14.0, title, 8.0);
    }

    fn into_document(self) -> Result<Document> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let regular = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        let bold = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica-Bold",
            "Encoding" => "WinAnsiEncoding",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => regular, "F2" => bold },
        });

        let mut kids: Vec<ObjectId> = Vec::with_capacity(self.pages.len());
        for operations in self.pages {
            let encoded = Content { operations }
                .encode()
                .map_err(|e| PipelineError::processing(format!("failed to encode resume page: {}", e)))?;
            let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
            kids.push(doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            }));
        }

        let pages = dictionary! {
            "Type" => "Pages",
            "Count" => kids.len() as i64,
            "Kids" => kids.into_iter().map(Object::Reference).collect::<Vec<_>>(),
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.compress();
        Ok(doc)
    }
}

pub fn render_resume(form: &ResumeForm) -> Result<Document> {
    let mut layout = ResumeLayout::new();
    layout.text(Face::Bold, 24.0, form.name.trim(), 10.0);
    for contact in [&form.email, &form.phone, &form.address] {
        if !contact.trim().is_empty() {
            layout.text(Face::Regular, 12.0, contact.trim(), 6.0);
        }
    }

    if !form.objective.trim().is_empty() {
        layout.heading("Objective");
        layout.text(Face::Regular, 12.0, &form.objective, 4.0);
    }

    if !form.experience.is_empty() {
        layout.heading("Experience");
        for entry in &form.experience {
            layout.text(Face::Bold, 12.0, &joined(&[&entry.position, &entry.company]), 3.0);
            if !entry.duration.trim().is_empty() {
                layout.text(Face::Regular, 10.0, &entry.duration, 3.0);
            }
            if !entry.description.trim().is_empty() {
                layout.text(Face::Regular, 12.0, &entry.description, 3.0);
            }
            layout.gap(8.0);
        }
    }

    if !form.education.is_empty() {
        layout.heading("Education");
        for entry in &form.education {
            layout.text(Face::Bold, 12.0, &joined(&[&entry.degree, &entry.institution]), 3.0);
            let detail = joined(&[&entry.year, &entry.grade]);
            if !detail.is_empty() {
                layout.text(Face::Regular, 10.0, &detail, 3.0);
            }
            layout.gap(8.0);
        }
    }

    let skills: Vec<&str> = form.skills.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
    if !skills.is_empty() {
        layout.heading("Skills");
        layout.text(Face::Regular, 12.0, &skills.join(", "), 4.0);
    }

    layout.into_document()
}

fn seeded_rng(job: &ProcessingJob) -> (StdRng, u64) {
    let seed = job.u64_opt("seed").unwrap_or_else(|| rand::random::<u32>() as u64);
    (StdRng::seed_from_u64(seed), seed)
}

async fn write_json(job: &ProcessingJob, name: &str, value: &Value) -> Result<HandlerOutput> {
    let out = job.output_path(name);
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| PipelineError::processing(format!("failed to serialize {}: {}", name, e)))?;
    tokio::fs::write(&out, body).await?;
    Ok(HandlerOutput::file(out, name).with_result(value.clone()))
}

pub struct TextHandler;

impl TextHandler {
    async fn convert_case(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let text = job.require_str("text")?;
        let case = job.str_or("case", "upper");
        let converted = TextCase::parse(case)?.apply(text);

        let name = "converted_text.txt";
        let out = job.output_path(name);
        tokio::fs::write(&out, converted.as_bytes()).await?;
        Ok(HandlerOutput::file(out, name).with_result(json!({ "case": case, "text": converted })))
    }

    async fn business_names(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let (mut rng, seed) = seeded_rng(job);
        let industry = job.str_or("industry", "general");
        let names = business_names(
            job.require_str("keywords")?,
            industry,
            job.u64_or("count", 10) as usize,
            &mut rng,
        )?;
        debug!(request_id = %job.request_id, seed, generated = names.len(), "business names generated");
        write_json(job, "business_names.json", &json!({ "industry": industry, "seed": seed, "names": names })).await
    }

    async fn blog_titles(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let (mut rng, seed) = seeded_rng(job);
        let tone = job.str_or("tone", "professional");
        let titles = blog_titles(
            job.require_str("keywords")?,
            tone,
            job.u64_or("count", 5) as usize,
            &mut rng,
        )?;
        write_json(job, "blog_titles.json", &json!({ "tone": tone, "seed": seed, "titles": titles })).await
    }

    async fn product_description(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let (mut rng, seed) = seeded_rng(job);
        let product = job.require_str("product_name")?;
        let features: Vec<String> = job
            .options
            .get("features")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let description = product_description(product, &features, job.str_or("target_audience", ""), &mut rng)?;
        write_json(
            job,
            "product_description.json",
            &json!({ "product_name": product, "seed": seed, "description": description }),
        )
        .await
    }

    async fn resume(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let raw = job
            .options
            .get("resume")
            .cloned()
            .ok_or_else(|| PipelineError::invalid("Missing required option: resume"))?;
        let form: ResumeForm =
            serde_json::from_value(raw).map_err(|e| PipelineError::invalid(format!("Invalid resume: {}", e)))?;
        if form.name.trim().is_empty() {
            return Err(PipelineError::invalid("Resume name is required"));
        }

        let slug = crate::artifact::sanitize_filename(&form.name.trim().to_lowercase());
        let name = format!("resume_{}.pdf", slug);
        let out = job.output_path(&name);
        let target = out.clone();
        let (pages, size) = run_blocking(move || {
            let mut doc = render_resume(&form)?;
            let pages = doc.get_pages().len();
            let size = save_pdf(&mut doc, &target)?;
            Ok((pages, size))
        })
        .await?;

        Ok(HandlerOutput::file(out, name).with_result(json!({ "pages": pages, "size": size })))
    }
}

#[async_trait]
impl ToolHandler for TextHandler {
    fn category(&self) -> ToolCategory {
        ToolCategory::Text
    }

    async fn process(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let Operation::Text(op) = job.operation() else {
            return Err(PipelineError::processing(format!("{} is not a text tool", job.tool.id)));
        };
        match op {
            TextOperation::CaseConvert => self.convert_case(job).await,
            TextOperation::BusinessNames => self.business_names(job).await,
            TextOperation::BlogTitles => self.blog_titles(job).await,
            TextOperation::ProductDescription => self.product_description(job).await,
            TextOperation::Resume => self.resume(job).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_conversions() {
        let text = "hello WORLD. it's rust!  yes";
        assert_eq!(TextCase::Upper.apply(text), "HELLO WORLD. IT'S RUST!  YES");
        assert_eq!(TextCase::Title.apply(text), "Hello World. It's Rust!  Yes");
        assert_eq!(TextCase::Sentence.apply(text), "Hello world. It's rust!  Yes");
        assert_eq!(TextCase::Toggle.apply("aBc1"), "AbC1");
    }

    #[test]
    fn test_generators_are_seeded() {
        let a = business_names("coffee, beans", "technology", 8, &mut StdRng::seed_from_u64(7)).unwrap();
        let b = business_names("coffee, beans", "technology", 8, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
        assert!(!a.is_empty() && a.len() <= 8);
        assert!(a.iter().all(|n| n.contains("Coffee") || n.contains("Beans")));

        let titles = blog_titles("rust", "casual", 3, &mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(titles.len(), 3);
        assert!(titles.iter().all(|t| t.contains("rust")));
    }

    #[test]
    fn test_titles_bounded_by_templates() {
        // one keyword, five templates: at most five distinct titles
        let titles = blog_titles("seo", "professional", 20, &mut StdRng::seed_from_u64(3)).unwrap();
        assert!(titles.len() <= PROFESSIONAL_TITLES.len());
    }

    #[test]
    fn test_blank_keywords_rejected() {
        let err = business_names(" , ", "general", 5, &mut StdRng::seed_from_u64(0)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn test_product_description_lists_features() {
        let features = vec!["Waterproof".to_string(), " ".to_string(), "Solar charging".to_string()];
        let a = product_description("TrailLamp", &features, "hikers", &mut StdRng::seed_from_u64(9)).unwrap();
        let b = product_description("TrailLamp", &features, "hikers", &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a, b);
        assert!(a.contains("TrailLamp") && a.contains("hikers"));
        assert!(a.contains("\u{2022} Waterproof\n\u{2022} Solar charging\n"));
        assert!(!a.contains("{product}") && !a.contains("{audience}"));

        let fallback = product_description("Widget", &[], "", &mut StdRng::seed_from_u64(1)).unwrap();
        assert!(fallback.contains(DEFAULT_AUDIENCE));
        assert!(DEFAULT_FEATURES.iter().all(|f| fallback.contains(f)));

        let err = product_description("  ", &[], "", &mut StdRng::seed_from_u64(1)).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn test_wrap() {
        let lines = wrap(&"word ".repeat(100), 12.0);
        assert!(lines.len() > 1);
        assert!(lines.iter().all(|l| l.chars().count() <= 85));
    }

    #[test]
    fn test_resume_breaks_pages() {
        let form = ResumeForm {
            name: "Ada Lovelace".into(),
            email: "ada@example.com".into(),
            experience: (0..60)
                .map(|i| ExperienceEntry {
                    position: format!("Engineer {}", i),
                    company: "Analytical Engines".into(),
                    duration: "1840-1843".into(),
                    description: "Wrote the first published algorithm.".into(),
                })
                .collect(),
            skills: vec!["Mathematics".into(), "Notes".into()],
            ..Default::default()
        };
        let doc = render_resume(&form).unwrap();
        assert!(doc.get_pages().len() > 1);
    }
}
