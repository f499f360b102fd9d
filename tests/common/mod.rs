#![allow(dead_code)]

use bytes::Bytes;
use image::{ImageBuffer, Rgb, RgbImage};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use toolora::config::Config;
use toolora::server::AppState;
use toolora::sweeper::CleanupSweeper;
use std::sync::Arc;

/// Config rooted in `dir` with short timeouts.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.upload_dir = dir.join("uploads");
    config.storage.output_dir = dir.join("outputs");
    config.subprocess_timeout = Duration::from_secs(60);
    config.processing_timeout = Duration::from_secs(120);
    config.video.max_concurrent_jobs = Some(2);
    config
}

pub fn services(dir: &Path) -> (AppState, Arc<CleanupSweeper>) {
    AppState::from_config(&test_config(dir)).expect("pipeline builds")
}

pub fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

/// PDF whose page `i` (0-based) has MediaBox width `base_width + i`.
pub fn pdf_with_pages(pages: u32, base_width: i64) -> Bytes {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids = Vec::new();
    for i in 0..pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![20.into(), 100.into()]),
                Operation::new("Tj", vec![Object::string_literal(format!("Page {}", i + 1))]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), (base_width + i as i64).into(), 400.into()],
        });
        kids.push(Object::Reference(page_id));
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
            "Resources" => resources_id,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    Bytes::from(buf)
}

/// Same document with a standard security handler `/Encrypt` entry in the trailer.
pub fn encrypted_pdf(pages: u32) -> Bytes {
    let mut doc = Document::load_mem(&pdf_with_pages(pages, 100)).unwrap();
    let encrypt_id = doc.add_object(dictionary! {
        "Filter" => "Standard",
        "V" => 2,
        "R" => 3,
        "Length" => 128,
        "P" => -3904,
        "O" => Object::string_literal(vec![0u8; 32]),
        "U" => Object::string_literal(vec![0u8; 32]),
    });
    doc.trailer.set("Encrypt", encrypt_id);
    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    Bytes::from(buf)
}

/// MediaBox widths of every page, in page order.
pub fn page_widths(bytes: &[u8]) -> Vec<i64> {
    let doc = Document::load_mem(bytes).unwrap();
    doc.get_pages()
        .into_values()
        .map(|id| {
            let page = doc.get_dictionary(id).unwrap();
            let media = page.get(b"MediaBox").unwrap().as_array().unwrap();
            match &media[2] {
                Object::Integer(i) => *i,
                Object::Real(r) => *r as i64,
                other => panic!("unexpected MediaBox entry {:?}", other),
            }
        })
        .collect()
}

pub fn page_count(bytes: &[u8]) -> usize {
    Document::load_mem(bytes).unwrap().get_pages().len()
}

/// Noisy gradient, so lossy encoders have something to throw away.
pub fn photo(width: u32, height: u32) -> RgbImage {
    ImageBuffer::from_fn(width, height, |x, y| {
        let noise = ((x * 7919 + y * 104729) % 61) as u8;
        Rgb([
            ((x * 255 / width.max(1)) as u8).wrapping_add(noise),
            ((y * 255 / height.max(1)) as u8).wrapping_sub(noise),
            (((x + y) * 3) % 256) as u8,
        ])
    })
}

pub fn jpeg_bytes(width: u32, height: u32, quality: u8) -> Bytes {
    let mut buf = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    photo(width, height).write_with_encoder(encoder).unwrap();
    Bytes::from(buf.into_inner())
}

pub fn png_bytes(width: u32, height: u32) -> Bytes {
    let mut buf = Cursor::new(Vec::new());
    photo(width, height)
        .write_to(&mut buf, image::ImageFormat::Png)
        .unwrap();
    Bytes::from(buf.into_inner())
}
