//! Text recognizer boundary
//!
//! Recognition itself is external. This module defines the token shape the
//! rest of the pipeline consumes, a parser for Tesseract's TSV output, an
//! adapter that shells out to the `tesseract` executable, and a cache keyed
//! by image content.

use image::{GrayImage, ImageFormat};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{FormError, Result};

/// One recognized word
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Recognized text
    pub text: String,
    /// Recognition confidence (0 - 100), absent for structural rows
    #[serde(default)]
    pub confidence: Option<f32>,
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    /// Layout block the word belongs to
    #[serde(default)]
    pub block_id: Option<u32>,
}

impl Token {
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Right edge, saturating at `u32::MAX` for out-of-range recognizer boxes
    pub fn right(&self) -> u32 {
        self.left.saturating_add(self.width)
    }

    /// Bottom edge, saturating at `u32::MAX`
    pub fn bottom(&self) -> u32 {
        self.top.saturating_add(self.height)
    }
}

/// External OCR collaborator
pub trait TextRecognizer {
    /// Recognize word-level tokens in a grayscale image
    fn recognize(&self, image: &GrayImage) -> Result<Vec<Token>>;
}

/// Tokens computed ahead of time, returned for any image
#[derive(Debug, Clone, Default)]
pub struct StaticTokens(pub Vec<Token>);

impl StaticTokens {
    /// Load a JSON array of tokens
    pub fn from_json(json: &str) -> Result<Self> {
        let tokens: Vec<Token> =
            serde_json::from_str(json).map_err(|e| FormError::Recognizer(e.to_string()))?;
        Ok(Self(tokens))
    }
}

impl TextRecognizer for StaticTokens {
    fn recognize(&self, _image: &GrayImage) -> Result<Vec<Token>> {
        Ok(self.0.clone())
    }
}

const TSV_COLUMNS: [&str; 12] = [
    "level", "page_num", "block_num", "par_num", "line_num", "word_num", "left", "top", "width",
    "height", "conf", "text",
];

fn column<'a>(fields: &[&'a str], columns: &HashMap<&str, usize>, name: &str) -> &'a str {
    columns
        .get(name)
        .and_then(|&i| fields.get(i))
        .map(|s| s.trim())
        .unwrap_or("")
}

fn invalid_value(line_no: usize, name: &str, raw: &str) -> FormError {
    FormError::Recognizer(format!("line {}: invalid {} value '{}'", line_no, name, raw))
}

/// Parse Tesseract `tsv` output into tokens
///
/// Negative confidences mark structural rows (page, block, line) and become
/// a missing confidence. Blank optional columns become missing values.
pub fn parse_tesseract_tsv(tsv: &str) -> Result<Vec<Token>> {
    let mut lines = tsv.lines().enumerate().peekable();

    // Column positions, taken from the header when present
    let columns: HashMap<&str, usize> = match lines.next_if(|(_, l)| l.starts_with("level")) {
        Some((_, header)) => header
            .split('\t')
            .enumerate()
            .filter_map(|(i, name)| {
                TSV_COLUMNS.iter().find(|c| **c == name.trim()).map(|c| (*c, i))
            })
            .collect(),
        None => TSV_COLUMNS.iter().enumerate().map(|(i, name)| (*name, i)).collect(),
    };

    let mut tokens = Vec::new();
    for (index, line) in lines {
        if line.trim().is_empty() {
            continue;
        }
        let line_no = index + 1;
        let fields: Vec<&str> = line.split('\t').collect();

        let number = |name: &str| -> Result<u32> {
            let raw = column(&fields, &columns, name);
            raw.parse::<u32>().map_err(|_| invalid_value(line_no, name, raw))
        };

        let confidence = match column(&fields, &columns, "conf") {
            "" => None,
            raw => {
                let value = raw
                    .parse::<f32>()
                    .map_err(|_| invalid_value(line_no, "conf", raw))?;
                (value >= 0.0).then_some(value)
            }
        };

        let block_id = match column(&fields, &columns, "block_num") {
            "" => None,
            _ => Some(number("block_num")?),
        };

        tokens.push(Token {
            text: column(&fields, &columns, "text").to_string(),
            confidence,
            left: number("left")?,
            top: number("top")?,
            width: number("width")?,
            height: number("height")?,
            block_id,
        });
    }

    Ok(tokens)
}

/// Runs the `tesseract` executable, piping a PNG on stdin
#[derive(Debug, Clone)]
pub struct TesseractCli {
    /// Executable name or path
    pub command: String,
    /// Language code passed with `-l`
    pub language: Option<String>,
    /// Page segmentation mode passed with `--psm`
    pub page_segmentation_mode: Option<u8>,
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self {
            command: "tesseract".to_string(),
            language: None,
            page_segmentation_mode: None,
        }
    }
}

impl TesseractCli {
    fn arguments(&self) -> Vec<String> {
        let mut args = vec!["stdin".to_string(), "stdout".to_string()];
        if let Some(lang) = &self.language {
            args.push("-l".to_string());
            args.push(lang.clone());
        }
        if let Some(psm) = self.page_segmentation_mode {
            args.push("--psm".to_string());
            args.push(psm.to_string());
        }
        args.push("tsv".to_string());
        args
    }
}

impl TextRecognizer for TesseractCli {
    fn recognize(&self, image: &GrayImage) -> Result<Vec<Token>> {
        let start = Instant::now();

        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png)?;

        let mut child = Command::new(&self.command)
            .args(self.arguments())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FormError::Recognizer(format!("failed to start {}: {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(png.get_ref())?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(FormError::Recognizer(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let tokens = parse_tesseract_tsv(&String::from_utf8_lossy(&output.stdout))?;
        info!(
            "Recognized {} tokens in {:?} ({}x{})",
            tokens.len(),
            start.elapsed(),
            image.width(),
            image.height()
        );
        Ok(tokens)
    }
}

/// Default number of images a [`CachedRecognizer`] remembers
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

struct CachedTokens {
    tokens: Vec<Token>,
    timestamp: Instant,
}

/// Memoizes another recognizer by image content
///
/// Holds at most `capacity` images, evicting the oldest entry first. Entries
/// older than the optional time-to-live are recognized again.
pub struct CachedRecognizer<R> {
    inner: R,
    capacity: usize,
    ttl: Option<Duration>,
    cache: Mutex<HashMap<[u8; 32], CachedTokens>>,
}

impl<R: TextRecognizer> CachedRecognizer<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            capacity: DEFAULT_CACHE_CAPACITY,
            ttl: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Remember at most `capacity` images (0 disables caching)
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Expire entries after `ttl`
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Number of cached images
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    fn cache_key(image: &GrayImage) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(image.width().to_le_bytes());
        hasher.update(image.height().to_le_bytes());
        hasher.update(image.as_raw());
        hasher.finalize().into()
    }

    fn is_fresh(&self, entry: &CachedTokens) -> bool {
        self.ttl.map_or(true, |ttl| entry.timestamp.elapsed() < ttl)
    }
}

impl<R: TextRecognizer> TextRecognizer for CachedRecognizer<R> {
    fn recognize(&self, image: &GrayImage) -> Result<Vec<Token>> {
        let key = Self::cache_key(image);
        if let Some(entry) = self.cache.lock().get(&key) {
            if self.is_fresh(entry) {
                debug!("Using cached recognizer results");
                return Ok(entry.tokens.clone());
            }
        }

        // Lock is not held while the recognizer runs
        let tokens = self.inner.recognize(image)?;
        if self.capacity == 0 {
            return Ok(tokens);
        }

        let mut cache = self.cache.lock();
        cache.retain(|_, entry| self.is_fresh(entry));
        while cache.len() >= self.capacity && !cache.contains_key(&key) {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.timestamp)
                .map(|(k, _)| *k);
            match oldest {
                Some(oldest) => {
                    cache.remove(&oldest);
                }
                None => break,
            }
        }
        cache.insert(
            key,
            CachedTokens {
                tokens: tokens.clone(),
                timestamp: Instant::now(),
            },
        );
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE_TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext
1\t1\t0\t0\t0\t0\t0\t0\t640\t480\t-1\t
2\t1\t1\t0\t0\t0\t36\t92\t582\t20\t-1\t
5\t1\t1\t1\t1\t1\t36\t92\t60\t20\t96.063751\tFirst
5\t1\t1\t1\t1\t2\t104\t92\t60\t20\t95.2\tName
5\t1\t2\t1\t1\t1\t36\t150\t40\t20\t91\tDate";

    #[test]
    fn test_parse_tesseract_tsv() {
        let tokens = parse_tesseract_tsv(SAMPLE_TSV).unwrap();
        assert_eq!(tokens.len(), 5);

        assert_eq!(tokens[0].confidence, None);
        assert!(tokens[0].is_blank());

        let first = &tokens[2];
        assert_eq!(first.text, "First");
        assert_eq!(first.block_id, Some(1));
        assert_eq!((first.left, first.top, first.width, first.height), (36, 92, 60, 20));
        assert!((first.confidence.unwrap() - 96.06375).abs() < 1e-3);

        assert_eq!(tokens[4].block_id, Some(2));
    }

    #[test]
    fn test_parse_tsv_without_header_or_text_column() {
        let tokens = parse_tesseract_tsv("5\t1\t3\t1\t1\t1\t10\t20\t30\t40\t88").unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].text, "");
        assert_eq!(tokens[0].block_id, Some(3));
        assert_eq!(tokens[0].confidence, Some(88.0));
    }

    #[test]
    fn test_parse_tsv_rejects_bad_numbers() {
        let result = parse_tesseract_tsv("5\t1\t1\t1\t1\t1\tten\t20\t30\t40\t88\tWord");
        assert!(matches!(result, Err(FormError::Recognizer(_))));
    }

    #[test]
    fn test_static_tokens_from_json() {
        let recognizer = StaticTokens::from_json(
            r#"[{"text": "Name", "confidence": 90, "left": 1, "top": 2, "width": 3, "height": 4, "block_id": 1},
                {"text": "Age", "left": 5, "top": 6, "width": 7, "height": 8}]"#,
        )
        .unwrap();

        let tokens = recognizer.recognize(&GrayImage::new(1, 1)).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].confidence, Some(90.0));
        assert_eq!(tokens[1].confidence, None);
        assert_eq!(tokens[1].block_id, None);
    }

    #[test]
    fn test_tesseract_arguments() {
        let cli = TesseractCli {
            language: Some("eng".to_string()),
            page_segmentation_mode: Some(6),
            ..Default::default()
        };
        assert_eq!(
            cli.arguments(),
            vec!["stdin", "stdout", "-l", "eng", "--psm", "6", "tsv"]
        );
    }

    struct CountingRecognizer {
        calls: AtomicUsize,
    }

    impl TextRecognizer for CountingRecognizer {
        fn recognize(&self, _image: &GrayImage) -> Result<Vec<Token>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    #[test]
    fn test_cached_recognizer_reuses_results() {
        let cached = CachedRecognizer::new(CountingRecognizer {
            calls: AtomicUsize::new(0),
        });

        let a = GrayImage::from_pixel(4, 4, Luma([10]));
        let b = GrayImage::from_pixel(4, 4, Luma([11]));

        cached.recognize(&a).unwrap();
        cached.recognize(&a).unwrap();
        cached.recognize(&b).unwrap();

        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cached.len(), 2);

        cached.clear();
        assert!(cached.is_empty());
    }

    fn counting() -> CountingRecognizer {
        CountingRecognizer {
            calls: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_cached_recognizer_evicts_oldest() {
        let cached = CachedRecognizer::new(counting()).with_capacity(2);
        let pages: Vec<GrayImage> = (0..3u8)
            .map(|v| GrayImage::from_pixel(4, 4, Luma([v])))
            .collect();

        for page in &pages {
            cached.recognize(page).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(cached.len(), 2);
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 3);

        // Newest two are still cached, the first was evicted
        cached.recognize(&pages[2]).unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 3);
        cached.recognize(&pages[0]).unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 4);
        assert_eq!(cached.len(), 2);
    }

    #[test]
    fn test_cached_recognizer_expires_entries() {
        let cached = CachedRecognizer::new(counting()).with_ttl(Duration::ZERO);
        let page = GrayImage::from_pixel(4, 4, Luma([3]));

        cached.recognize(&page).unwrap();
        cached.recognize(&page).unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cached.len(), 1);
    }

    #[test]
    fn test_cached_recognizer_zero_capacity() {
        let cached = CachedRecognizer::new(counting()).with_capacity(0);
        let page = GrayImage::from_pixel(4, 4, Luma([3]));

        cached.recognize(&page).unwrap();
        cached.recognize(&page).unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
        assert!(cached.is_empty());
    }
}
