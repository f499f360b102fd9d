//! Audio track extraction settings for the transcoder

use crate::error::{PipelineError, Result};

pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    Aac,
    Wav,
}

impl AudioFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "mp3" => Ok(AudioFormat::Mp3),
            "aac" | "m4a" => Ok(AudioFormat::Aac),
            "wav" => Ok(AudioFormat::Wav),
            other => Err(PipelineError::invalid(format!("Unsupported audio format '{}'", other))),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Aac => "aac",
            AudioFormat::Wav => "wav",
        }
    }

    /// Container extension of the produced file
    pub fn extension(&self) -> &str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Aac => "m4a",
            AudioFormat::Wav => "wav",
        }
    }

    /// Encoder arguments placed after the input.
    pub fn codec_args(&self, bitrate: &str) -> Vec<String> {
        let mut args: Vec<String> = vec!["-vn".into()];
        match self {
            AudioFormat::Mp3 => args.extend(["-c:a", "libmp3lame", "-b:a", bitrate].map(String::from)),
            AudioFormat::Aac => args.extend(["-c:a", "aac", "-b:a", bitrate].map(String::from)),
            AudioFormat::Wav => args.extend(["-c:a", "pcm_s16le"].map(String::from)),
        }
        args.push("-ar".into());
        args.push(DEFAULT_SAMPLE_RATE.to_string());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mp3_args() {
        let args = AudioFormat::parse("MP3").unwrap().codec_args("192k");
        assert_eq!(args, vec!["-vn", "-c:a", "libmp3lame", "-b:a", "192k", "-ar", "44100"]);
    }

    #[test]
    fn test_wav_ignores_bitrate() {
        let args = AudioFormat::Wav.codec_args("320k");
        assert!(!args.iter().any(|a| a == "320k"));
        assert_eq!(AudioFormat::Aac.extension(), "m4a");
    }

    #[test]
    fn test_unknown_format() {
        assert!(AudioFormat::parse("ogg").is_err());
    }
}
