//! PDF processing
//!
//! In-process document surgery with `lopdf` (merge, split, extract, rotate,
//! watermark, compress). Encryption and decryption shell out to `qpdf`.
//!
//! Every in-process operation re-reads its output and checks the page count:
//! equal to the input for page-level transforms, the sum of the inputs for
//! merge, and the selected subset for split and extract.

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::ImageFormat;
use lopdf::content::{Content, Operation as PdfOp};
use lopdf::{dictionary, Bookmark, Dictionary, Document, Object, ObjectId, Stream};
use rayon::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::handler::{ensure_exists, output_name, run_blocking, HandlerOutput, ProcessingJob, ProducedFile, ToolHandler};
use crate::registry::{Operation, PdfOperation, ToolCategory, ToolDescriptor};
use crate::subprocess::{CommandError, ExternalCommand};

/// Upper bound on documents produced by one split
const MAX_SPLIT_PARTS: usize = 500;

const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// One span of a page selection such as `3-7` or `5-` (open ended).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    start: u32,
    end: Option<u32>,
}

/// Parse `"1-3,5,7-"` style selections. Page numbers are 1-based.
pub fn parse_page_spans(spec: &str) -> Result<Vec<PageSpan>> {
    let invalid = |part: &str| PipelineError::invalid(format!("Invalid page range '{}'", part.trim()));
    let mut spans = Vec::new();

    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let span = match part.split_once('-') {
            Some((start, end)) => {
                let start = if start.trim().is_empty() {
                    1
                } else {
                    start.trim().parse::<u32>().map_err(|_| invalid(part))?
                };
                let end = if end.trim().is_empty() {
                    None
                } else {
                    Some(end.trim().parse::<u32>().map_err(|_| invalid(part))?)
                };
                PageSpan { start, end }
            }
            None => {
                let page = part.parse::<u32>().map_err(|_| invalid(part))?;
                PageSpan { start: page, end: Some(page) }
            }
        };
        if span.start == 0 || span.end.is_some_and(|end| end < span.start) {
            return Err(invalid(part));
        }
        spans.push(span);
    }

    if spans.is_empty() {
        return Err(PipelineError::invalid("No pages selected"));
    }
    Ok(spans)
}

/// Bind spans to a document with `page_count` pages.
pub fn resolve_spans(spans: &[PageSpan], page_count: u32) -> Result<Vec<RangeInclusive<u32>>> {
    spans
        .iter()
        .map(|span| {
            let end = span.end.unwrap_or(page_count);
            if span.start > page_count || end > page_count {
                return Err(PipelineError::invalid(format!(
                    "Page range {}-{} is outside the document (it has {} pages)",
                    span.start, end, page_count
                )));
            }
            Ok(span.start..=end)
        })
        .collect()
}

fn selected_pages(ranges: &[RangeInclusive<u32>]) -> BTreeSet<u32> {
    ranges.iter().flat_map(|r| r.clone()).collect()
}

pub struct PdfHandler {
    qpdf: PathBuf,
    timeout: Duration,
}

impl PdfHandler {
    pub fn new(qpdf: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            qpdf: qpdf.into(),
            timeout,
        }
    }

    async fn protect(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let input = job.input()?;
        let user = job.require_str("password")?;
        let owner = job.str_opt("owner_password").unwrap_or(user);
        let name = output_name("protected_", &input.original_filename, "pdf");
        let out = job.output_path(&name);

        ExternalCommand::new(&self.qpdf, self.timeout)
            .secret_args(&job.work_dir, &["--encrypt", user, owner, "256", "--"])?
            .arg(&input.path)
            .output(&out)
            .success_codes(&[3])
            .execute(&job.cancel)
            .await?;

        ensure_exists(&out)?;
        Ok(HandlerOutput::file(out, name))
    }

    async fn unlock(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let input = job.input()?;
        let password = job.require_str("password")?;
        let name = output_name("unlocked_", &input.original_filename, "pdf");
        let out = job.output_path(&name);

        let password_arg = format!("--password={}", password);
        let result = ExternalCommand::new(&self.qpdf, self.timeout)
            .secret_args(&job.work_dir, &[password_arg.as_str(), "--decrypt"])?
            .arg(&input.path)
            .output(&out)
            .success_codes(&[3])
            .execute(&job.cancel)
            .await;

        match result {
            Ok(_) => {}
            Err(CommandError::ExecutionFailed { ref stderr, .. }) if stderr.contains("invalid password") => {
                return Err(PipelineError::invalid("The password is incorrect"));
            }
            Err(e) => return Err(e.into()),
        }

        ensure_exists(&out)?;
        Ok(HandlerOutput::file(out, name))
    }
}

#[async_trait]
impl ToolHandler for PdfHandler {
    fn category(&self) -> ToolCategory {
        ToolCategory::Pdf
    }

    fn validate(&self, tool: &ToolDescriptor, options: &Map<String, Value>) -> Result<()> {
        let spans = |key: &str| match options.get(key).and_then(Value::as_str) {
            Some(spec) if !spec.trim().is_empty() => parse_page_spans(spec).map(|_| ()),
            _ => Ok(()),
        };
        match tool.operation {
            Operation::Pdf(PdfOperation::Split) => spans("ranges"),
            Operation::Pdf(PdfOperation::ExtractPages) | Operation::Pdf(PdfOperation::Rotate) => spans("pages"),
            Operation::Pdf(PdfOperation::Protect) | Operation::Pdf(PdfOperation::Unlock) => {
                let broken = ["password", "owner_password"].iter().any(|key| {
                    options
                        .get(*key)
                        .and_then(Value::as_str)
                        .is_some_and(|p| p.contains(['\n', '\r']))
                });
                if broken {
                    return Err(PipelineError::invalid("Passwords cannot contain line breaks"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn process(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let Operation::Pdf(op) = job.operation() else {
            return Err(PipelineError::processing(format!("{} is not a PDF tool", job.tool.id)));
        };

        match op {
            PdfOperation::Protect => return self.protect(job).await,
            PdfOperation::Unlock => return self.unlock(job).await,
            _ => {}
        }

        let job = job.clone();
        run_blocking(move || match op {
            PdfOperation::Merge => merge(&job),
            PdfOperation::Split => split(&job),
            PdfOperation::Compress => compress(&job),
            PdfOperation::Rotate => rotate(&job),
            PdfOperation::Watermark => watermark(&job),
            PdfOperation::ExtractPages => extract(&job),
            PdfOperation::Protect | PdfOperation::Unlock => {
                Err(PipelineError::processing("encryption runs through qpdf"))
            }
        })
        .await
    }
}

/// Load a PDF, refusing encrypted documents.
pub fn load_pdf(path: &Path) -> Result<Document> {
    let bytes = std::fs::read(path)?;
    let doc = Document::load_mem(&bytes)
        .map_err(|e| PipelineError::processing(format!("unreadable PDF {}: {}", path.display(), e)))?;
    if doc.is_encrypted() || doc.trailer.has(b"Encrypt") {
        return Err(PipelineError::processing(format!("{} is encrypted", path.display())));
    }
    if doc.get_pages().is_empty() {
        return Err(PipelineError::processing(format!("{} has no pages", path.display())));
    }
    Ok(doc)
}

pub fn page_count(path: &Path) -> Result<u32> {
    Ok(load_pdf(path)?.get_pages().len() as u32)
}

pub(crate) fn save_pdf(doc: &mut Document, path: &Path) -> Result<u64> {
    let mut buf = Vec::new();
    doc.save_to(&mut buf)
        .map_err(|e| PipelineError::processing(format!("failed to serialize PDF: {}", e)))?;
    std::fs::write(path, &buf)?;
    Ok(buf.len() as u64)
}

fn verify_pages(path: &Path, expected: u32) -> Result<()> {
    let actual = page_count(path)?;
    if actual != expected {
        return Err(PipelineError::processing(format!(
            "page count mismatch in {}: expected {}, produced {}",
            path.display(),
            expected,
            actual
        )));
    }
    Ok(())
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

fn resolved_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    resolve(doc, obj).as_dict().ok()
}

/// Page attributes a page inherits from its ancestors in the page tree.
fn inherited_attributes(doc: &Document, page_id: ObjectId) -> Vec<(Vec<u8>, Object)> {
    let mut found: Vec<(Vec<u8>, Object)> = Vec::new();
    let Ok(page) = doc.get_dictionary(page_id) else {
        return found;
    };

    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();
    let mut seen = HashSet::new();
    while let Some(node_id) = parent {
        if !seen.insert(node_id) {
            break;
        }
        let Ok(node) = doc.get_dictionary(node_id) else {
            break;
        };
        for key in INHERITABLE {
            if page.has(key) || found.iter().any(|(k, _)| k.as_slice() == key) {
                continue;
            }
            if let Ok(value) = node.get(key) {
                found.push((key.to_vec(), value.clone()));
            }
        }
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    found
}

fn effective_attribute(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let page = doc.get_dictionary(page_id).ok()?;
    if let Ok(value) = page.get(key) {
        return Some(value.clone());
    }
    inherited_attributes(doc, page_id)
        .into_iter()
        .find(|(k, _)| k.as_slice() == key)
        .map(|(_, v)| v)
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

fn media_box(doc: &Document, page_id: ObjectId) -> [f32; 4] {
    effective_attribute(doc, page_id, b"MediaBox")
        .and_then(|obj| {
            let arr = resolve(doc, &obj).as_array().ok()?.clone();
            let values: Vec<f32> = arr.iter().filter_map(|o| number(resolve(doc, o))).collect();
            (values.len() == 4).then(|| [values[0], values[1], values[2], values[3]])
        })
        .unwrap_or([0.0, 0.0, 612.0, 792.0])
}

#[derive(Debug)]
struct OutlineEntry {
    title: String,
    page: ObjectId,
    children: Vec<OutlineEntry>,
}

fn decode_text(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}

fn outline_target(doc: &Document, item: &Dictionary) -> Option<ObjectId> {
    let dest = match item.get(b"Dest") {
        Ok(dest) => resolve(doc, dest),
        Err(_) => {
            let action = resolved_dict(doc, item.get(b"A").ok()?)?;
            if action.get(b"S").ok()?.as_name().ok()? != b"GoTo" {
                return None;
            }
            resolve(doc, action.get(b"D").ok()?)
        }
    };
    dest.as_array().ok()?.first()?.as_reference().ok()
}

fn collect_outline(doc: &Document) -> Vec<OutlineEntry> {
    let Ok(catalog) = doc.catalog() else {
        return Vec::new();
    };
    let Some(root) = catalog.get(b"Outlines").ok().and_then(|o| resolved_dict(doc, o)) else {
        return Vec::new();
    };
    let pages: HashSet<ObjectId> = doc.get_pages().into_values().collect();
    let mut seen = HashSet::new();
    outline_level(doc, root.get(b"First").ok(), &pages, &mut seen, 0)
}

fn outline_level(
    doc: &Document,
    first: Option<&Object>,
    pages: &HashSet<ObjectId>,
    seen: &mut HashSet<ObjectId>,
    depth: usize,
) -> Vec<OutlineEntry> {
    let mut entries = Vec::new();
    if depth > 32 {
        return entries;
    }
    let mut cursor = first.and_then(|o| o.as_reference().ok());

    while let Some(id) = cursor {
        if !seen.insert(id) {
            break;
        }
        let Ok(item) = doc.get_dictionary(id) else {
            break;
        };
        let children = outline_level(doc, item.get(b"First").ok(), pages, seen, depth + 1);
        let title = match item.get(b"Title").map(|t| resolve(doc, t)) {
            Ok(Object::String(bytes, _)) => decode_text(bytes),
            _ => String::new(),
        };

        match outline_target(doc, item).filter(|page| pages.contains(page)) {
            Some(page) => entries.push(OutlineEntry { title, page, children }),
            // Unresolvable destinations keep their children at this level
            None => entries.extend(children),
        }
        cursor = item.get(b"Next").ok().and_then(|o| o.as_reference().ok());
    }
    entries
}

fn add_bookmarks(doc: &mut Document, entries: Vec<OutlineEntry>, parent: Option<u32>) {
    for entry in entries {
        let id = doc.add_bookmark(Bookmark::new(entry.title, [0.0, 0.0, 0.0], 0, entry.page), parent);
        add_bookmarks(doc, entry.children, Some(id));
    }
}

fn merge(job: &ProcessingJob) -> Result<HandlerOutput> {
    let mut merged = Document::with_version("1.5");
    let pages_id = merged.new_object_id();
    let mut kids: Vec<Object> = Vec::new();
    let mut outlines: Vec<OutlineEntry> = Vec::new();

    for input in &job.inputs {
        let mut doc = load_pdf(&input.path)?;
        doc.renumber_objects_with(merged.max_id + 1);

        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        let source_outline = collect_outline(&doc);
        if source_outline.is_empty() {
            // Documents without bookmarks get one pointing at their first page
            outlines.push(OutlineEntry {
                title: crate::artifact::stem_of(&input.original_filename).to_string(),
                page: page_ids[0],
                children: Vec::new(),
            });
        } else {
            outlines.extend(source_outline);
        }

        for page_id in &page_ids {
            let inherited = inherited_attributes(&doc, *page_id);
            let page = doc
                .get_object_mut(*page_id)
                .and_then(Object::as_dict_mut)
                .map_err(|e| PipelineError::processing(format!("malformed page object: {}", e)))?;
            for (key, value) in inherited {
                page.set(key, value);
            }
            page.set("Parent", pages_id);
            kids.push(Object::Reference(*page_id));
        }

        let max_id = doc.max_id;
        for (id, object) in doc.objects {
            let skip = matches!(object.type_name(), Ok("Catalog") | Ok("Pages"));
            if !skip {
                merged.objects.insert(id, object);
            }
        }
        merged.max_id = merged.max_id.max(max_id);
        debug!(request_id = %job.request_id, file = %input.original_filename, pages = page_ids.len(), "merged document");
    }

    let total = kids.len() as u32;
    merged.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => total as i64,
        }),
    );
    let catalog_id = merged.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    merged.trailer.set("Root", catalog_id);

    add_bookmarks(&mut merged, outlines, None);
    if let Some(outline_id) = merged.build_outline() {
        if let Ok(Object::Dictionary(catalog)) = merged.get_object_mut(catalog_id) {
            catalog.set("Outlines", Object::Reference(outline_id));
            catalog.set("PageMode", "UseOutlines");
        }
    }

    merged.prune_objects();
    merged.renumber_objects();
    merged.compress();

    let first = job.input()?;
    let name = output_name("merged_", &first.original_filename, "pdf");
    let out = job.output_path(&name);
    save_pdf(&mut merged, &out)?;
    verify_pages(&out, total)?;

    info!(request_id = %job.request_id, documents = job.inputs.len(), pages = total, "📄 PDFs merged");
    Ok(HandlerOutput::file(out, name))
}

/// Document parsed from `source` keeping only `keep` (1-based page numbers).
fn subset(source: &[u8], keep: &BTreeSet<u32>) -> Result<Document> {
    let mut part = Document::load_mem(source)
        .map_err(|e| PipelineError::processing(format!("unreadable PDF: {}", e)))?;
    let total = part.get_pages().len() as u32;
    let drop: Vec<u32> = (1..=total).filter(|p| !keep.contains(p)).collect();
    if !drop.is_empty() {
        part.delete_pages(&drop);
    }
    part.prune_objects();
    part.compress();
    Ok(part)
}

fn split(job: &ProcessingJob) -> Result<HandlerOutput> {
    let input = job.input()?;
    let doc = load_pdf(&input.path)?;
    let total = doc.get_pages().len() as u32;

    let ranges: Vec<RangeInclusive<u32>> = match job.str_opt("ranges").filter(|s| !s.trim().is_empty()) {
        Some(spec) => resolve_spans(&parse_page_spans(spec)?, total)?,
        None => {
            let per_file = job.u64_or("pages_per_file", 1).clamp(1, u32::MAX as u64) as u32;
            (1..=total)
                .step_by(per_file as usize)
                .map(|start| start..=(start + per_file - 1).min(total))
                .collect()
        }
    };
    if ranges.len() > MAX_SPLIT_PARTS {
        return Err(PipelineError::invalid(format!(
            "Split would produce {} files; the limit is {}",
            ranges.len(),
            MAX_SPLIT_PARTS
        )));
    }

    let source = std::fs::read(&input.path)?;
    let stem = crate::artifact::stem_of(&input.original_filename).to_string();
    let files = ranges
        .par_iter()
        .enumerate()
        .map(|(index, range)| {
            let keep: BTreeSet<u32> = range.clone().collect();
            let mut part = subset(&source, &keep)?;
            let name = format!("split_part_{}_{}.pdf", index + 1, stem);
            let out = job.output_path(&name);
            save_pdf(&mut part, &out)?;
            verify_pages(&out, keep.len() as u32)?;
            Ok(ProducedFile::new(out, name))
        })
        .collect::<Result<Vec<_>>>()?;

    info!(request_id = %job.request_id, parts = files.len(), "✂️ PDF split");
    Ok(HandlerOutput { files, result: None })
}

fn extract(job: &ProcessingJob) -> Result<HandlerOutput> {
    let input = job.input()?;
    let doc = load_pdf(&input.path)?;
    let total = doc.get_pages().len() as u32;
    let keep = selected_pages(&resolve_spans(&parse_page_spans(job.require_str("pages")?)?, total)?);

    let mut part = subset(&std::fs::read(&input.path)?, &keep)?;
    let name = output_name("extracted_", &input.original_filename, "pdf");
    let out = job.output_path(&name);
    save_pdf(&mut part, &out)?;
    verify_pages(&out, keep.len() as u32)?;
    Ok(HandlerOutput::file(out, name))
}

fn rotate(job: &ProcessingJob) -> Result<HandlerOutput> {
    let input = job.input()?;
    let mut doc = load_pdf(&input.path)?;
    let angle = job.u64_or("angle", 90) as i64;
    if angle % 90 != 0 {
        return Err(PipelineError::invalid("Rotation angle must be a multiple of 90"));
    }

    let pages = doc.get_pages();
    let total = pages.len() as u32;
    let targets = match job.str_opt("pages").filter(|s| !s.trim().is_empty()) {
        Some(spec) => selected_pages(&resolve_spans(&parse_page_spans(spec)?, total)?),
        None => (1..=total).collect(),
    };

    for (number, page_id) in pages {
        if !targets.contains(&number) {
            continue;
        }
        let current = effective_attribute(&doc, page_id, b"Rotate")
            .and_then(|o| o.as_i64().ok())
            .unwrap_or(0);
        let rotation = (current + angle).rem_euclid(360);
        if let Ok(page) = doc.get_object_mut(page_id).and_then(Object::as_dict_mut) {
            page.set("Rotate", rotation);
        }
    }

    let name = output_name("rotated_", &input.original_filename, "pdf");
    let out = job.output_path(&name);
    save_pdf(&mut doc, &out)?;
    verify_pages(&out, total)?;
    Ok(HandlerOutput::file(out, name))
}

/// Resources dictionary for a page with any referenced sub-dictionary inlined.
fn owned_resources(doc: &Document, page_id: ObjectId) -> Dictionary {
    let Some(resources) = effective_attribute(doc, page_id, b"Resources") else {
        return Dictionary::new();
    };
    let Some(dict) = resolved_dict(doc, &resources) else {
        return Dictionary::new();
    };
    let mut owned = dict.clone();
    for key in [&b"Font"[..], b"ExtGState"] {
        if let Ok(Object::Reference(id)) = dict.get(key) {
            if let Ok(inner) = doc.get_dictionary(*id) {
                owned.set(key.to_vec(), Object::Dictionary(inner.clone()));
            }
        }
    }
    owned
}

fn insert_resource(resources: &mut Dictionary, category: &[u8], name: &[u8], value: Object) {
    let mut inner = match resources.get(category) {
        Ok(Object::Dictionary(d)) => d.clone(),
        _ => Dictionary::new(),
    };
    inner.set(name.to_vec(), value);
    resources.set(category.to_vec(), Object::Dictionary(inner));
}

fn content_refs(doc: &Document, page_id: ObjectId) -> Vec<Object> {
    doc.get_page_contents(page_id).into_iter().map(Object::Reference).collect()
}

/// Latin-1 bytes for the standard 14 fonts; other characters become '?'.
pub(crate) fn latin1(text: &str) -> Vec<u8> {
    text.chars().map(|c| if (c as u32) < 256 { c as u8 } else { b'?' }).collect()
}

fn watermark_ops(text: &[u8], font_size: f32, opacity: f32, position: &str, media: [f32; 4]) -> Vec<PdfOp> {
    let [x0, y0, x1, y1] = media;
    let (width, height) = (x1 - x0, y1 - y0);
    // Helvetica averages roughly half an em per glyph
    let text_width = text.len() as f32 * font_size * 0.5;
    let margin = 10.0 + font_size * 0.25;

    let (a, b, c, d, e, f) = match position {
        "top-left" => (1.0, 0.0, 0.0, 1.0, x0 + margin, y1 - margin - font_size),
        "top-right" => (1.0, 0.0, 0.0, 1.0, x1 - margin - text_width, y1 - margin - font_size),
        "bottom-left" => (1.0, 0.0, 0.0, 1.0, x0 + margin, y0 + margin),
        "bottom-right" => (1.0, 0.0, 0.0, 1.0, x1 - margin - text_width, y0 + margin),
        _ => {
            let angle = (height / width.max(1.0)).atan().min(std::f32::consts::FRAC_PI_4 * 1.2);
            let (sin, cos) = angle.sin_cos();
            let cx = x0 + width / 2.0;
            let cy = y0 + height / 2.0;
            let half = text_width / 2.0;
            (cos, sin, -sin, cos, cx - half * cos + font_size * 0.35 * sin, cy - half * sin - font_size * 0.35 * cos)
        }
    };

    let mut ops = vec![PdfOp::new("q", vec![])];
    if opacity < 1.0 {
        ops.push(PdfOp::new("gs", vec![Object::Name(b"GSwm0".to_vec())]));
    }
    ops.extend([
        PdfOp::new("g", vec![0.5f32.into()]),
        PdfOp::new("BT", vec![]),
        PdfOp::new("Tf", vec![Object::Name(b"Fwm0".to_vec()), font_size.into()]),
        PdfOp::new("Tm", vec![a.into(), b.into(), c.into(), d.into(), e.into(), f.into()]),
        PdfOp::new("Tj", vec![Object::string_literal(text.to_vec())]),
        PdfOp::new("ET", vec![]),
        PdfOp::new("Q", vec![]),
    ]);
    ops
}

fn watermark(job: &ProcessingJob) -> Result<HandlerOutput> {
    let input = job.input()?;
    let mut doc = load_pdf(&input.path)?;
    let text = latin1(job.require_str("text")?);
    let opacity = job.f64_or("opacity", 0.3).clamp(0.0, 1.0) as f32;
    let font_size = job.u64_or("font_size", 48) as f32;
    let position = job.str_or("position", "center").to_string();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let gs_id = doc.add_object(dictionary! {
        "Type" => "ExtGState",
        "ca" => opacity,
        "CA" => opacity,
    });

    let pages = doc.get_pages();
    let total = pages.len() as u32;
    for page_id in pages.into_values() {
        let media = media_box(&doc, page_id);
        let mut resources = owned_resources(&doc, page_id);
        insert_resource(&mut resources, b"Font", b"Fwm0", Object::Reference(font_id));
        insert_resource(&mut resources, b"ExtGState", b"GSwm0", Object::Reference(gs_id));

        let existing = content_refs(&doc, page_id);
        let ops = watermark_ops(&text, font_size, opacity, &position, media);
        let encoded = Content { operations: ops }
            .encode()
            .map_err(|e| PipelineError::processing(format!("failed to encode watermark: {}", e)))?;

        // Isolate the original content's graphics state from the overlay
        let open = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
        let mut close_and_stamp = b"Q\n".to_vec();
        close_and_stamp.extend_from_slice(&encoded);
        let stamp = doc.add_object(Stream::new(Dictionary::new(), close_and_stamp));

        let mut contents = vec![Object::Reference(open)];
        contents.extend(existing);
        contents.push(Object::Reference(stamp));

        let page = doc
            .get_object_mut(page_id)
            .and_then(Object::as_dict_mut)
            .map_err(|e| PipelineError::processing(format!("malformed page object: {}", e)))?;
        page.set("Resources", Object::Dictionary(resources));
        page.set("Contents", contents);
    }

    doc.compress();
    let name = output_name("watermarked_", &input.original_filename, "pdf");
    let out = job.output_path(&name);
    save_pdf(&mut doc, &out)?;
    verify_pages(&out, total)?;
    Ok(HandlerOutput::file(out, name))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompressionLevel {
    Low,
    Medium,
    High,
}

impl CompressionLevel {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(PipelineError::invalid(format!("Unknown compression level '{}'", other))),
        }
    }

    fn jpeg_quality(&self) -> Option<u8> {
        match self {
            Self::High => Some(50),
            _ => None,
        }
    }
}

fn is_plain_dct(dict: &Dictionary) -> Option<bool> {
    if dict.get(b"Subtype").ok()?.as_name().ok()? != b"Image" {
        return None;
    }
    let filter = match dict.get(b"Filter").ok()? {
        Object::Name(name) => name.clone(),
        Object::Array(filters) if filters.len() == 1 => filters[0].as_name().ok()?.to_vec(),
        _ => return None,
    };
    if filter != b"DCTDecode" || dict.get(b"BitsPerComponent").ok()?.as_i64().ok()? != 8 {
        return None;
    }
    match dict.get(b"ColorSpace").ok()?.as_name().ok()? {
        b"DeviceRGB" => Some(false),
        b"DeviceGray" => Some(true),
        _ => None,
    }
}

fn reencode_jpeg(data: &[u8], gray: bool, quality: u8) -> Option<Vec<u8>> {
    let img = image::load_from_memory_with_format(data, ImageFormat::Jpeg).ok()?;
    let mut out = Vec::with_capacity(data.len() / 2);
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    let encoded = if gray {
        encoder.encode_image(&img.to_luma8())
    } else {
        encoder.encode_image(&img.to_rgb8())
    };
    encoded.ok()?;
    (out.len() < data.len()).then_some(out)
}

fn strip_metadata(doc: &mut Document) {
    if let Ok(catalog) = doc.catalog_mut() {
        catalog.remove(b"Metadata");
        catalog.remove(b"PieceInfo");
    }
    for page_id in doc.get_pages().into_values() {
        if let Ok(page) = doc.get_object_mut(page_id).and_then(Object::as_dict_mut) {
            page.remove(b"Thumb");
            page.remove(b"PieceInfo");
        }
    }
}

fn compress(job: &ProcessingJob) -> Result<HandlerOutput> {
    let input = job.input()?;
    let original_size = std::fs::metadata(&input.path)?.len();
    let level = CompressionLevel::parse(job.str_or("level", "medium"))?;
    let mut doc = load_pdf(&input.path)?;
    let total = doc.get_pages().len() as u32;

    if level != CompressionLevel::Low {
        strip_metadata(&mut doc);
    }

    if let Some(quality) = level.jpeg_quality() {
        let candidates: Vec<(ObjectId, Vec<u8>, bool)> = doc
            .objects
            .iter()
            .filter_map(|(id, obj)| match obj {
                Object::Stream(stream) => is_plain_dct(&stream.dict).map(|gray| (*id, stream.content.clone(), gray)),
                _ => None,
            })
            .collect();

        let recompressed: Vec<(ObjectId, Vec<u8>)> = candidates
            .into_par_iter()
            .filter_map(|(id, data, gray)| reencode_jpeg(&data, gray, quality).map(|out| (id, out)))
            .collect();

        debug!(request_id = %job.request_id, images = recompressed.len(), "re-encoded embedded JPEGs");
        for (id, data) in recompressed {
            if let Some(Object::Stream(stream)) = doc.objects.get_mut(&id) {
                stream.set_content(data);
            }
        }
    }

    doc.prune_objects();
    doc.compress();

    let name = output_name("compressed_", &input.original_filename, "pdf");
    let out = job.output_path(&name);
    let new_size = save_pdf(&mut doc, &out)?;

    if new_size >= original_size {
        warn!(request_id = %job.request_id, original_size, new_size, "compression did not shrink PDF, keeping original bytes");
        std::fs::copy(&input.path, &out)?;
    }
    verify_pages(&out, total)?;

    info!(
        request_id = %job.request_id,
        level = ?level,
        original_size,
        new_size = new_size.min(original_size),
        "🗜️ PDF compressed"
    );
    Ok(HandlerOutput::file(out, name).with_result(json!({
        "original_size": original_size,
        "compressed_size": new_size.min(original_size),
    })))
}
