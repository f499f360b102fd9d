//! Tool registry
//!
//! Immutable mapping from tool id to [`ToolDescriptor`], built once at startup
//! and shared by reference. Each descriptor names the category-specific
//! [`Operation`] it runs, so dispatch is a match on a tagged enum rather than a
//! string lookup inside the handlers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::LimitsConfig;
use crate::error::{PipelineError, Result};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Pdf,
    Image,
    Video,
    Text,
    Utility,
}

impl ToolCategory {
    pub const ALL: [ToolCategory; 5] = [
        ToolCategory::Pdf,
        ToolCategory::Image,
        ToolCategory::Video,
        ToolCategory::Text,
        ToolCategory::Utility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Pdf => "pdf",
            ToolCategory::Image => "image",
            ToolCategory::Video => "video",
            ToolCategory::Text => "text",
            ToolCategory::Utility => "utility",
        }
    }

    /// Built-in per-file ceiling, further capped by the global limit.
    pub fn default_max_file_size(&self) -> u64 {
        match self {
            ToolCategory::Pdf => 64 * MIB,
            ToolCategory::Image => 32 * MIB,
            ToolCategory::Video => 512 * MIB,
            ToolCategory::Text | ToolCategory::Utility => MIB,
        }
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfOperation {
    Merge,
    Split,
    Compress,
    Rotate,
    Watermark,
    ExtractPages,
    Protect,
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageOperation {
    Compress,
    Resize,
    Convert,
    Crop,
    Rotate,
    Watermark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaOperation {
    Trim,
    ExtractAudio,
    RemoveAudio,
    Compress,
    Convert,
    VerticalCrop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOperation {
    CaseConvert,
    BusinessNames,
    BlogTitles,
    ProductDescription,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtilityOperation {
    QrCode,
    Password,
}

/// What a tool does, tagged by the category whose handler runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", content = "op", rename_all = "lowercase")]
pub enum Operation {
    Pdf(PdfOperation),
    Image(ImageOperation),
    Video(MediaOperation),
    Text(TextOperation),
    Utility(UtilityOperation),
}

impl Operation {
    pub fn category(&self) -> ToolCategory {
        match self {
            Operation::Pdf(_) => ToolCategory::Pdf,
            Operation::Image(_) => ToolCategory::Image,
            Operation::Video(_) => ToolCategory::Video,
            Operation::Text(_) => ToolCategory::Text,
            Operation::Utility(_) => ToolCategory::Utility,
        }
    }
}

/// Static description of one tool. Immutable after startup.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub display_name: String,
    pub icon: String,
    pub description: String,
    pub operation: Operation,
    /// Lowercase extensions without the dot
    pub extensions: Vec<String>,
    pub min_files: usize,
    pub max_files: usize,
    pub max_file_size: u64,
    /// JSON-schema subset understood by [`crate::validation::normalize_options`]
    pub options_schema: Value,
}

impl ToolDescriptor {
    pub fn category(&self) -> ToolCategory {
        self.operation.category()
    }

    pub fn accepts_files(&self) -> bool {
        self.max_files > 0
    }

    pub fn accepts_extension(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        self.extensions.iter().any(|e| *e == ext)
    }
}

/// Catalog entry returned by `GET /api/tools`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCard {
    pub id: String,
    pub name: String,
    pub category: ToolCategory,
    pub icon: String,
    pub description: String,
    pub extensions: Vec<String>,
    pub min_files: usize,
    pub max_files: usize,
    pub max_file_size: u64,
    pub options_schema: Value,
}

#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDescriptor>>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// Build a registry from explicit descriptors, rejecting inconsistent entries.
    pub fn from_descriptors(descriptors: Vec<ToolDescriptor>) -> Result<Self> {
        let mut tools = HashMap::with_capacity(descriptors.len());
        let mut order = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors {
            if descriptor.min_files > descriptor.max_files {
                return Err(PipelineError::Config(format!(
                    "tool '{}' has min_files {} > max_files {}",
                    descriptor.id, descriptor.min_files, descriptor.max_files
                )));
            }
            if descriptor.accepts_files() && descriptor.extensions.is_empty() {
                return Err(PipelineError::Config(format!(
                    "tool '{}' accepts files but allows no extensions",
                    descriptor.id
                )));
            }
            if tools.contains_key(&descriptor.id) {
                return Err(PipelineError::Config(format!("duplicate tool id '{}'", descriptor.id)));
            }
            order.push(descriptor.id.clone());
            tools.insert(descriptor.id.clone(), Arc::new(descriptor));
        }

        Ok(Self { tools, order })
    }

    /// The built-in tool table with limits applied from configuration.
    pub fn builtin(limits: &LimitsConfig) -> Result<Self> {
        let descriptors = builtin_tools()
            .into_iter()
            .map(|spec| spec.into_descriptor(limits))
            .collect();
        Self::from_descriptors(descriptors)
    }

    pub fn resolve(&self, tool_id: &str) -> Result<Arc<ToolDescriptor>> {
        self.tools
            .get(tool_id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("tool '{}'", tool_id)))
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.tools.contains_key(tool_id)
    }

    /// Descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ToolDescriptor>> {
        self.order.iter().filter_map(|id| self.tools.get(id))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn describe(&self) -> Vec<ToolCard> {
        self.iter()
            .map(|tool| ToolCard {
                id: tool.id.clone(),
                name: tool.display_name.clone(),
                category: tool.category(),
                icon: tool.icon.clone(),
                description: tool.description.clone(),
                extensions: tool.extensions.clone(),
                min_files: tool.min_files,
                max_files: tool.max_files,
                max_file_size: tool.max_file_size,
                options_schema: tool.options_schema.clone(),
            })
            .collect()
    }
}

struct BuiltinTool {
    id: &'static str,
    name: &'static str,
    icon: &'static str,
    description: &'static str,
    operation: Operation,
    extensions: &'static [&'static str],
    files: (usize, usize),
    schema: Value,
}

impl BuiltinTool {
    fn into_descriptor(self, limits: &LimitsConfig) -> ToolDescriptor {
        let category = self.operation.category();
        let mut extensions: Vec<String> = self.extensions.iter().map(|e| e.to_string()).collect();
        if let Some(allowed) = limits.extensions_for(category) {
            extensions.retain(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)));
        }

        ToolDescriptor {
            id: self.id.to_string(),
            display_name: self.name.to_string(),
            icon: self.icon.to_string(),
            description: self.description.to_string(),
            operation: self.operation,
            extensions,
            min_files: self.files.0,
            max_files: self.files.1,
            max_file_size: limits.max_file_size_for(category),
            options_schema: self.schema,
        }
    }
}

const PDF_EXTS: &[&str] = &["pdf"];
const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "gif", "tiff", "tif"];
const VIDEO_EXTS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v", "flv", "wmv"];

const POSITIONS: [&str; 5] = ["top-left", "top-right", "bottom-left", "bottom-right", "center"];

fn no_options() -> Value {
    json!({ "type": "object", "properties": {} })
}

fn builtin_tools() -> Vec<BuiltinTool> {
    use ImageOperation as I;
    use MediaOperation as M;
    use PdfOperation as P;

    vec![
        // PDF
        BuiltinTool {
            id: "pdf-merge",
            name: "PDF Merger",
            icon: "ti ti-files",
            description: "Combine multiple PDF files into one document, keeping page order and bookmarks",
            operation: Operation::Pdf(P::Merge),
            extensions: PDF_EXTS,
            files: (2, 20),
            schema: no_options(),
        },
        BuiltinTool {
            id: "pdf-split",
            name: "PDF Splitter",
            icon: "ti ti-cut",
            description: "Split a PDF into several documents by page ranges",
            operation: Operation::Pdf(P::Split),
            extensions: PDF_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "ranges": { "type": "string", "maxLength": 1000, "description": "Page ranges such as \"1-3,5,7-\"; each range becomes one file" },
                    "pages_per_file": { "type": "integer", "minimum": 1, "default": 1, "description": "Used when no ranges are given" }
                }
            }),
        },
        BuiltinTool {
            id: "pdf-compress",
            name: "PDF Compressor",
            icon: "ti ti-file-zip",
            description: "Reduce PDF size by recompressing content streams and embedded images",
            operation: Operation::Pdf(P::Compress),
            extensions: PDF_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "level": { "type": "string", "enum": ["low", "medium", "high"], "default": "medium" }
                }
            }),
        },
        BuiltinTool {
            id: "pdf-rotate",
            name: "PDF Rotator",
            icon: "ti ti-rotate-clockwise",
            description: "Rotate all or selected pages of a PDF",
            operation: Operation::Pdf(P::Rotate),
            extensions: PDF_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "angle": { "type": "integer", "enum": [90, 180, 270], "default": 90 },
                    "pages": { "type": "string", "maxLength": 1000, "description": "Pages to rotate; all pages when omitted" }
                }
            }),
        },
        BuiltinTool {
            id: "pdf-watermark",
            name: "PDF Watermark",
            icon: "ti ti-droplet",
            description: "Stamp a text watermark on every page",
            operation: Operation::Pdf(P::Watermark),
            extensions: PDF_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "minLength": 1, "maxLength": 200 },
                    "position": { "type": "string", "enum": POSITIONS, "default": "center" },
                    "opacity": { "type": "number", "minimum": 0.0, "maximum": 1.0, "default": 0.3 },
                    "font_size": { "type": "integer", "minimum": 6, "maximum": 200, "default": 48 }
                },
                "required": ["text"]
            }),
        },
        BuiltinTool {
            id: "pdf-extract-pages",
            name: "PDF Page Extractor",
            icon: "ti ti-file-export",
            description: "Extract selected pages into a new PDF",
            operation: Operation::Pdf(P::ExtractPages),
            extensions: PDF_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "pages": { "type": "string", "minLength": 1, "maxLength": 1000 }
                },
                "required": ["pages"]
            }),
        },
        BuiltinTool {
            id: "pdf-protect",
            name: "PDF Password Protect",
            icon: "ti ti-lock",
            description: "Encrypt a PDF with a password (AES-256)",
            operation: Operation::Pdf(P::Protect),
            extensions: PDF_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "password": { "type": "string", "minLength": 1, "maxLength": 128 },
                    "owner_password": { "type": "string", "minLength": 1, "maxLength": 128 }
                },
                "required": ["password"]
            }),
        },
        BuiltinTool {
            id: "pdf-unlock",
            name: "PDF Unlock",
            icon: "ti ti-lock-open",
            description: "Remove the password from a PDF you can open",
            operation: Operation::Pdf(P::Unlock),
            extensions: PDF_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "password": { "type": "string", "maxLength": 128 }
                },
                "required": ["password"]
            }),
        },
        // Image
        BuiltinTool {
            id: "image-compress",
            name: "Image Compressor",
            icon: "ti ti-photo-down",
            description: "Shrink images with adjustable quality",
            operation: Operation::Image(I::Compress),
            extensions: IMAGE_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "quality": { "type": "integer", "minimum": 1, "maximum": 100, "default": 85 },
                    "format": { "type": "string", "enum": ["jpeg", "webp", "png"] },
                    "max_dimension": { "type": "integer", "minimum": 16, "maximum": 20000 }
                }
            }),
        },
        BuiltinTool {
            id: "image-resize",
            name: "Image Resizer",
            icon: "ti ti-resize",
            description: "Resize images to exact dimensions or fit within a box",
            operation: Operation::Image(I::Resize),
            extensions: IMAGE_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "width": { "type": "integer", "minimum": 1, "maximum": 20000 },
                    "height": { "type": "integer", "minimum": 1, "maximum": 20000 },
                    "mode": { "type": "string", "enum": ["fit", "exact"], "default": "fit" },
                    "allow_upscale": { "type": "boolean", "default": false }
                }
            }),
        },
        BuiltinTool {
            id: "image-convert",
            name: "Image Converter",
            icon: "ti ti-transform",
            description: "Convert images between common formats",
            operation: Operation::Image(I::Convert),
            extensions: IMAGE_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "format": { "type": "string", "enum": ["jpeg", "png", "webp", "bmp", "gif", "tiff"] },
                    "quality": { "type": "integer", "minimum": 1, "maximum": 100, "default": 90 }
                },
                "required": ["format"]
            }),
        },
        BuiltinTool {
            id: "image-crop",
            name: "Image Cropper",
            icon: "ti ti-crop",
            description: "Crop a region out of an image",
            operation: Operation::Image(I::Crop),
            extensions: IMAGE_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "x": { "type": "integer", "minimum": 0, "default": 0 },
                    "y": { "type": "integer", "minimum": 0, "default": 0 },
                    "width": { "type": "integer", "minimum": 1 },
                    "height": { "type": "integer", "minimum": 1 }
                },
                "required": ["width", "height"]
            }),
        },
        BuiltinTool {
            id: "image-rotate",
            name: "Image Rotator",
            icon: "ti ti-rotate",
            description: "Rotate by quarter turns and flip images",
            operation: Operation::Image(I::Rotate),
            extensions: IMAGE_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "angle": { "type": "integer", "enum": [0, 90, 180, 270], "default": 90 },
                    "flip": { "type": "string", "enum": ["none", "horizontal", "vertical"], "default": "none" }
                }
            }),
        },
        BuiltinTool {
            id: "image-watermark",
            name: "Image Watermark",
            icon: "ti ti-writing",
            description: "Overlay semi-transparent text on an image",
            operation: Operation::Image(I::Watermark),
            extensions: IMAGE_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "minLength": 1, "maxLength": 200 },
                    "position": { "type": "string", "enum": POSITIONS, "default": "bottom-right" },
                    "opacity": { "type": "number", "minimum": 0.0, "maximum": 1.0, "default": 0.5 },
                    "scale": { "type": "integer", "minimum": 1, "maximum": 32, "description": "Glyph scale; derived from image size when omitted" }
                },
                "required": ["text"]
            }),
        },
        // Video / audio
        BuiltinTool {
            id: "video-trimmer",
            name: "Video Trimmer",
            icon: "ti ti-scissors",
            description: "Cut a segment out of a video",
            operation: Operation::Video(M::Trim),
            extensions: VIDEO_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "start": { "type": "number", "minimum": 0.0, "default": 0.0 },
                    "duration": { "type": "number", "minimum": 0.1, "maximum": 86400.0 },
                    "precise": { "type": "boolean", "default": true, "description": "Re-encode for frame-accurate cuts; stream copy otherwise" }
                },
                "required": ["duration"]
            }),
        },
        BuiltinTool {
            id: "video-to-mp3",
            name: "Video to MP3",
            icon: "ti ti-music",
            description: "Extract the audio track from a video",
            operation: Operation::Video(M::ExtractAudio),
            extensions: VIDEO_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "format": { "type": "string", "enum": ["mp3", "aac", "wav"], "default": "mp3" },
                    "bitrate": { "type": "string", "enum": ["64k", "96k", "128k", "192k", "256k", "320k"], "default": "192k" }
                }
            }),
        },
        BuiltinTool {
            id: "audio-remover",
            name: "Audio Remover",
            icon: "ti ti-volume-off",
            description: "Strip the audio track from a video",
            operation: Operation::Video(M::RemoveAudio),
            extensions: VIDEO_EXTS,
            files: (1, 1),
            schema: no_options(),
        },
        BuiltinTool {
            id: "video-compress",
            name: "Video Compressor",
            icon: "ti ti-file-zip",
            description: "Re-encode a video to H.264 at a lower bitrate",
            operation: Operation::Video(M::Compress),
            extensions: VIDEO_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "crf": { "type": "integer", "minimum": 18, "maximum": 51, "default": 23 },
                    "preset": {
                        "type": "string",
                        "enum": ["ultrafast", "superfast", "veryfast", "faster", "fast", "medium", "slow", "slower", "veryslow"],
                        "default": "medium"
                    }
                }
            }),
        },
        BuiltinTool {
            id: "video-converter",
            name: "Video Converter",
            icon: "ti ti-transform",
            description: "Convert a video to another container format",
            operation: Operation::Video(M::Convert),
            extensions: VIDEO_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "format": { "type": "string", "enum": ["mp4", "webm", "mkv", "mov", "avi"] }
                },
                "required": ["format"]
            }),
        },
        BuiltinTool {
            id: "shorts-cropper",
            name: "Shorts Cropper",
            icon: "ti ti-device-mobile",
            description: "Center-crop a video to 9:16 for vertical platforms",
            operation: Operation::Video(M::VerticalCrop),
            extensions: VIDEO_EXTS,
            files: (1, 1),
            schema: json!({
                "type": "object",
                "properties": {
                    "height": { "type": "integer", "minimum": 240, "maximum": 3840, "description": "Output height; source height when omitted" }
                }
            }),
        },
        // Text
        BuiltinTool {
            id: "text-case-converter",
            name: "Text Case Converter",
            icon: "ti ti-letter-case",
            description: "Convert text to upper, lower, title, sentence or toggled case",
            operation: Operation::Text(TextOperation::CaseConvert),
            extensions: &[],
            files: (0, 0),
            schema: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "minLength": 1, "maxLength": 100000 },
                    "case": { "type": "string", "enum": ["upper", "lower", "title", "sentence", "toggle"], "default": "upper" }
                },
                "required": ["text"]
            }),
        },
        BuiltinTool {
            id: "business-name-generator",
            name: "Business Name Generator",
            icon: "ti ti-building-store",
            description: "Suggest business names from keywords and an industry",
            operation: Operation::Text(TextOperation::BusinessNames),
            extensions: &[],
            files: (0, 0),
            schema: json!({
                "type": "object",
                "properties": {
                    "keywords": { "type": "string", "minLength": 1, "maxLength": 500 },
                    "industry": { "type": "string", "enum": ["general", "technology", "healthcare", "finance", "education"], "default": "general" },
                    "count": { "type": "integer", "minimum": 1, "maximum": 50, "default": 10 },
                    "seed": { "type": "integer", "minimum": 0 }
                },
                "required": ["keywords"]
            }),
        },
        BuiltinTool {
            id: "blog-title-generator",
            name: "Blog Title Generator",
            icon: "ti ti-article",
            description: "Suggest blog post titles for a set of keywords",
            operation: Operation::Text(TextOperation::BlogTitles),
            extensions: &[],
            files: (0, 0),
            schema: json!({
                "type": "object",
                "properties": {
                    "keywords": { "type": "string", "minLength": 1, "maxLength": 500 },
                    "tone": { "type": "string", "enum": ["professional", "casual"], "default": "professional" },
                    "count": { "type": "integer", "minimum": 1, "maximum": 20, "default": 5 },
                    "seed": { "type": "integer", "minimum": 0 }
                },
                "required": ["keywords"]
            }),
        },
        BuiltinTool {
            id: "product-description-generator",
            name: "Product Description Generator",
            icon: "ti ti-tag",
            description: "Draft marketing copy for a product from its features and audience",
            operation: Operation::Text(TextOperation::ProductDescription),
            extensions: &[],
            files: (0, 0),
            schema: json!({
                "type": "object",
                "properties": {
                    "product_name": { "type": "string", "minLength": 1, "maxLength": 200 },
                    "features": { "type": "array", "maxItems": 20, "description": "Feature list; a comma separated string is accepted" },
                    "target_audience": { "type": "string", "maxLength": 200 },
                    "seed": { "type": "integer", "minimum": 0 }
                },
                "required": ["product_name"]
            }),
        },
        BuiltinTool {
            id: "resume-generator",
            name: "Resume Generator",
            icon: "ti ti-file-cv",
            description: "Lay out resume details as a printable PDF",
            operation: Operation::Text(TextOperation::Resume),
            extensions: &[],
            files: (0, 0),
            schema: json!({
                "type": "object",
                "properties": {
                    "resume": { "type": "object" }
                },
                "required": ["resume"]
            }),
        },
        // Utility
        BuiltinTool {
            id: "qr-generator",
            name: "QR Code Generator",
            icon: "ti ti-qrcode",
            description: "Encode text or a URL as a QR code image",
            operation: Operation::Utility(UtilityOperation::QrCode),
            extensions: &[],
            files: (0, 0),
            schema: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "minLength": 1, "maxLength": 2000 },
                    "size": { "type": "integer", "minimum": 64, "maximum": 2048, "default": 300 },
                    "error_correction": { "type": "string", "enum": ["L", "M", "Q", "H"], "default": "M" }
                },
                "required": ["text"]
            }),
        },
        BuiltinTool {
            id: "password-generator",
            name: "Password Generator",
            icon: "ti ti-key",
            description: "Generate strong random passwords",
            operation: Operation::Utility(UtilityOperation::Password),
            extensions: &[],
            files: (0, 0),
            schema: json!({
                "type": "object",
                "properties": {
                    "length": { "type": "integer", "minimum": 4, "maximum": 128, "default": 16 },
                    "uppercase": { "type": "boolean", "default": true },
                    "lowercase": { "type": "boolean", "default": true },
                    "digits": { "type": "boolean", "default": true },
                    "symbols": { "type": "boolean", "default": true },
                    "exclude_ambiguous": { "type": "boolean", "default": false },
                    "count": { "type": "integer", "minimum": 1, "maximum": 50, "default": 1 }
                }
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CategoryLimits;

    #[test]
    fn test_builtin_registry_is_consistent() {
        let registry = ToolRegistry::builtin(&LimitsConfig::default()).unwrap();
        assert_eq!(registry.len(), 27);

        let merge = registry.resolve("pdf-merge").unwrap();
        assert_eq!(merge.category(), ToolCategory::Pdf);
        assert_eq!((merge.min_files, merge.max_files), (2, 20));
        assert!(merge.accepts_extension("PDF"));
        assert!(!merge.accepts_extension("docx"));

        for category in ToolCategory::ALL {
            assert!(registry.iter().any(|t| t.category() == category));
        }
    }

    #[test]
    fn test_unknown_tool_is_not_found() {
        let registry = ToolRegistry::builtin(&LimitsConfig::default()).unwrap();
        let err = registry.resolve("pdf-to-word").unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[test]
    fn test_category_overrides_apply() {
        let mut limits = LimitsConfig::default();
        limits.categories.insert(
            ToolCategory::Image,
            CategoryLimits {
                max_file_size: Some(1234),
                extensions: Some(vec!["PNG".to_string()]),
            },
        );
        let registry = ToolRegistry::builtin(&limits).unwrap();
        let tool = registry.resolve("image-resize").unwrap();
        assert_eq!(tool.max_file_size, 1234);
        assert_eq!(tool.extensions, vec!["png".to_string()]);
    }

    #[test]
    fn test_category_override_removing_all_extensions_fails() {
        let mut limits = LimitsConfig::default();
        limits.categories.insert(
            ToolCategory::Pdf,
            CategoryLimits {
                max_file_size: None,
                extensions: Some(vec!["docx".to_string()]),
            },
        );
        assert!(ToolRegistry::builtin(&limits).is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let limits = LimitsConfig::default();
        let a = builtin_tools().remove(0).into_descriptor(&limits);
        let b = a.clone();
        assert!(ToolRegistry::from_descriptors(vec![a, b]).is_err());
    }

    #[test]
    fn test_describe_preserves_order() {
        let registry = ToolRegistry::builtin(&LimitsConfig::default()).unwrap();
        let cards = registry.describe();
        assert_eq!(cards.first().map(|c| c.id.as_str()), Some("pdf-merge"));
        assert_eq!(cards.last().map(|c| c.id.as_str()), Some("password-generator"));
    }
}
