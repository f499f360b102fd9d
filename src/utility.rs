//! QR codes and passwords

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{ImageFormat, Luma};
use qrcode::{EcLevel, QrCode};
use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::SeedableRng;
use serde_json::json;

use crate::error::{PipelineError, Result};
use crate::handler::{run_blocking, HandlerOutput, ProcessingJob, ToolHandler};
use crate::registry::{Operation, ToolCategory, UtilityOperation};

const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
const DIGITS: &str = "0123456789";
const SYMBOLS: &str = "!@#$%^&*()-_=+[]{};:,.?";
/// Characters easily confused with one another when read back
const AMBIGUOUS: &str = "Il1O0o|";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub length: usize,
    pub uppercase: bool,
    pub lowercase: bool,
    pub digits: bool,
    pub symbols: bool,
    pub exclude_ambiguous: bool,
}

impl PasswordPolicy {
    /// Enabled character classes, ambiguous characters removed when requested.
    fn classes(&self) -> Vec<Vec<char>> {
        [
            (self.uppercase, UPPERCASE),
            (self.lowercase, LOWERCASE),
            (self.digits, DIGITS),
            (self.symbols, SYMBOLS),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .map(|(_, set)| {
            set.chars()
                .filter(|c| !(self.exclude_ambiguous && AMBIGUOUS.contains(*c)))
                .collect()
        })
        .collect()
    }

    /// Bits of entropy for a uniformly drawn password of this shape
    pub fn entropy_bits(&self) -> f64 {
        let pool: usize = self.classes().iter().map(Vec::len).sum();
        if pool == 0 {
            return 0.0;
        }
        self.length as f64 * (pool as f64).log2()
    }
}

/// Generate one password containing at least one character of every enabled class.
pub fn generate_password(policy: &PasswordPolicy, rng: &mut StdRng) -> Result<String> {
    let classes = policy.classes();
    if classes.is_empty() {
        return Err(PipelineError::invalid("Select at least one character class"));
    }
    if policy.length < classes.len() {
        return Err(PipelineError::invalid(format!(
            "Length {} is too short for {} character classes",
            policy.length,
            classes.len()
        )));
    }

    let pool: Vec<char> = classes.iter().flatten().copied().collect();
    let mut chars: Vec<char> = Vec::with_capacity(policy.length);
    for class in &classes {
        chars.extend(class.choose(rng));
    }
    while chars.len() < policy.length {
        chars.extend(pool.choose(rng));
    }
    chars.shuffle(rng);
    Ok(chars.into_iter().collect())
}

/// CSPRNG seeded from the operating system
fn secure_rng() -> Result<StdRng> {
    StdRng::try_from_os_rng().map_err(|e| PipelineError::processing(format!("OS random source unavailable: {}", e)))
}

pub fn parse_ec_level(value: &str) -> Result<EcLevel> {
    match value.to_ascii_uppercase().as_str() {
        "L" => Ok(EcLevel::L),
        "M" => Ok(EcLevel::M),
        "Q" => Ok(EcLevel::Q),
        "H" => Ok(EcLevel::H),
        other => Err(PipelineError::invalid(format!("Unknown error correction level '{}'", other))),
    }
}

/// Render `text` as a square PNG exactly `size` pixels wide.
pub fn render_qr(text: &str, size: u32, level: EcLevel) -> Result<image::GrayImage> {
    let code = QrCode::with_error_correction_level(text.as_bytes(), level)
        .map_err(|e| PipelineError::invalid(format!("Cannot encode QR code: {}", e)))?;
    let rendered = code
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(size, size)
        .build();
    if rendered.width() == size {
        return Ok(rendered);
    }
    // Nearest keeps module edges crisp
    Ok(image::imageops::resize(&rendered, size, size, FilterType::Nearest))
}

pub struct UtilityHandler;

impl UtilityHandler {
    async fn qr_code(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let text = job.require_str("text")?.to_string();
        let size = job.u64_or("size", 300) as u32;
        let level_name = job.str_or("error_correction", "M").to_string();
        let level = parse_ec_level(&level_name)?;

        let name = "qr_code.png";
        let out = job.output_path(name);
        let target = out.clone();
        run_blocking(move || {
            let img = render_qr(&text, size, level)?;
            img.save_with_format(&target, ImageFormat::Png)
                .map_err(|e| PipelineError::processing(format!("failed to write QR code: {}", e)))
        })
        .await?;

        Ok(HandlerOutput::file(out, name).with_result(json!({
            "size": size,
            "error_correction": level_name,
        })))
    }

    async fn passwords(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let policy = PasswordPolicy {
            length: job.u64_or("length", 16) as usize,
            uppercase: job.bool_or("uppercase", true),
            lowercase: job.bool_or("lowercase", true),
            digits: job.bool_or("digits", true),
            symbols: job.bool_or("symbols", true),
            exclude_ambiguous: job.bool_or("exclude_ambiguous", false),
        };
        let count = job.u64_or("count", 1) as usize;

        let mut rng = secure_rng()?;
        let passwords = (0..count)
            .map(|_| generate_password(&policy, &mut rng))
            .collect::<Result<Vec<_>>>()?;

        let name = "passwords.txt";
        let out = job.output_path(name);
        let mut body = passwords.join("\n");
        body.push('\n');
        tokio::fs::write(&out, body).await?;

        Ok(HandlerOutput::file(out, name).with_result(json!({
            "passwords": passwords,
            "length": policy.length,
            "entropy_bits": policy.entropy_bits().round(),
        })))
    }
}

#[async_trait]
impl ToolHandler for UtilityHandler {
    fn category(&self) -> ToolCategory {
        ToolCategory::Utility
    }

    async fn process(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let Operation::Utility(op) = job.operation() else {
            return Err(PipelineError::processing(format!("{} is not a utility tool", job.tool.id)));
        };
        match op {
            UtilityOperation::QrCode => self.qr_code(job).await,
            UtilityOperation::Password => self.passwords(job).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(length: usize) -> PasswordPolicy {
        PasswordPolicy {
            length,
            uppercase: true,
            lowercase: true,
            digits: true,
            symbols: true,
            exclude_ambiguous: false,
        }
    }

    #[test]
    fn test_password_covers_every_class() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let pw = generate_password(&policy(4), &mut rng).unwrap();
            assert_eq!(pw.chars().count(), 4);
            assert!(pw.chars().any(|c| c.is_ascii_uppercase()));
            assert!(pw.chars().any(|c| c.is_ascii_lowercase()));
            assert!(pw.chars().any(|c| c.is_ascii_digit()));
            assert!(pw.chars().any(|c| SYMBOLS.contains(c)));
        }
    }

    #[test]
    fn test_exclude_ambiguous() {
        let mut rng = StdRng::seed_from_u64(9);
        let policy = PasswordPolicy {
            exclude_ambiguous: true,
            ..policy(128)
        };
        let pw = generate_password(&policy, &mut rng).unwrap();
        assert!(!pw.chars().any(|c| AMBIGUOUS.contains(c)));
    }

    #[test]
    fn test_no_classes_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let policy = PasswordPolicy {
            uppercase: false,
            lowercase: false,
            digits: false,
            symbols: false,
            ..policy(16)
        };
        assert!(matches!(generate_password(&policy, &mut rng), Err(PipelineError::InvalidInput(_))));
        assert!(secure_rng().is_ok());
    }

    #[test]
    fn test_qr_exact_size() {
        let img = render_qr("https://example.com", 300, EcLevel::M).unwrap();
        assert_eq!(img.dimensions(), (300, 300));
        // quiet zone is white
        assert_eq!(img.get_pixel(0, 0).0[0], 255);
        assert!(img.pixels().any(|p| p.0[0] == 0));
    }

    #[test]
    fn test_ec_levels() {
        assert_eq!(parse_ec_level("h").unwrap(), EcLevel::H);
        assert!(parse_ec_level("X").is_err());
    }
}
