//! Font loading and text measurement using `ttf-parser`.
//!
//! The layout engine only sees the [`TextMeasure`] trait. [`FontManager`]
//! implements it from real glyph advances when a font is loaded and from a
//! width heuristic otherwise; the heuristic treats CJK and other full-width
//! characters as one em wide so tables in those scripts still get sane
//! column widths.

use std::sync::Arc;

/// Measurement oracle used for layout decisions. Must be a pure function of
/// its inputs.
pub trait TextMeasure {
    /// Rendered width of `text` in points.
    fn text_width(&self, text: &str, font_size: f32, bold: bool) -> f32;

    /// Distance between consecutive baselines, in points.
    fn line_height(&self, font_size: f32, line_height_factor: f32) -> f32 {
        font_size * line_height_factor
    }
}

/// A loaded font face with metrics.
#[derive(Debug, Clone)]
pub struct FontData {
    /// Raw font bytes (kept alive for ttf-parser's zero-copy API).
    pub bytes: Arc<Vec<u8>>,
    /// Face index inside a collection (`.ttc`).
    pub index: u32,
    pub units_per_em: f32,
    pub ascender: f32,
}

impl FontData {
    /// Parse and validate a TTF/OTF font.
    pub fn parse(bytes: Arc<Vec<u8>>) -> Result<Self, String> {
        Self::parse_indexed(bytes, 0)
    }

    /// Parse face `index` of a font or font collection.
    pub fn parse_indexed(bytes: Arc<Vec<u8>>, index: u32) -> Result<Self, String> {
        let face = ttf_parser::Face::parse(&bytes, index)
            .map_err(|e| format!("Failed to parse font: {e}"))?;
        Ok(Self {
            index,
            units_per_em: face.units_per_em() as f32,
            ascender: face.ascender() as f32,
            bytes: bytes.clone(),
        })
    }
}

/// Measures text either with a loaded face or with builtin Helvetica-like
/// metrics.
#[derive(Debug, Clone, Default)]
pub struct FontManager {
    font: Option<FontData>,
}

impl FontManager {
    /// Heuristic metrics only.
    pub fn new() -> Self {
        Self { font: None }
    }

    pub fn with_font(font: FontData) -> Self {
        Self { font: Some(font) }
    }

    /// Font bytes for embedding in the output document.
    pub fn font(&self) -> Option<&FontData> {
        self.font.as_ref()
    }

    /// Ascender in points for the given size.
    pub fn ascender(&self, font_size: f32) -> f32 {
        match &self.font {
            Some(f) => f.ascender * font_size / f.units_per_em,
            None => font_size * 0.75,
        }
    }

    fn heuristic_width(text: &str, font_size: f32, bold: bool) -> f32 {
        // Bold is ~10 % wider.
        let narrow = if bold { 0.55 } else { 0.5 };
        text.chars()
            .map(|c| if is_wide(c) { 1.0 } else { narrow })
            .sum::<f32>()
            * font_size
    }
}

impl TextMeasure for FontManager {
    fn text_width(&self, text: &str, font_size: f32, bold: bool) -> f32 {
        let Some(data) = &self.font else {
            return Self::heuristic_width(text, font_size, bold);
        };

        // Parse the font and sum horizontal advances
        let Ok(face) = ttf_parser::Face::parse(&data.bytes, data.index) else {
            return Self::heuristic_width(text, font_size, bold);
        };
        let scale = font_size / data.units_per_em;
        let mut width = 0.0f32;
        for ch in text.chars() {
            match face.glyph_index(ch).and_then(|gid| face.glyph_hor_advance(gid)) {
                Some(advance) => width += advance as f32 * scale,
                // Fallback for missing glyph
                None => width += Self::heuristic_width(ch.encode_utf8(&mut [0; 4]), font_size, bold),
            }
        }
        // No synthetic bold on embedded faces; reserve a little extra room.
        if bold {
            width * 1.05
        } else {
            width
        }
    }
}

/// Full-width characters: CJK ideographs, kana, hangul, full-width forms.
pub fn is_wide(c: char) -> bool {
    matches!(c as u32,
        0x1100..=0x115F
        | 0x2E80..=0x303E
        | 0x3040..=0x33FF
        | 0x3400..=0x4DBF
        | 0x4E00..=0x9FFF
        | 0xA000..=0xA4CF
        | 0xAC00..=0xD7A3
        | 0xF900..=0xFAFF
        | 0xFE30..=0xFE4F
        | 0xFF00..=0xFF60
        | 0xFFE0..=0xFFE6
        | 0x20000..=0x3FFFD)
}

/// Wrap text to fit within `max_width` points. Returns the lines.
///
/// Existing newlines are kept. Lines are first broken at whitespace; any
/// line that is still too wide (long tokens, scripts without spaces) is
/// broken again between characters.
pub fn wrap_text(
    text: &str,
    font_size: f32,
    bold: bool,
    max_width: f32,
    measure: &dyn TextMeasure,
) -> Vec<String> {
    if max_width <= 0.0 || text.is_empty() {
        return vec![text.to_string()];
    }

    let mut lines: Vec<String> = Vec::new();
    // Split on existing newlines first
    for paragraph in text.split('\n') {
        let paragraph = paragraph.trim_end_matches('\r');
        let words: Vec<&str> = paragraph.split_whitespace().collect();
        if words.is_empty() {
            lines.push(String::new());
            continue;
        }

        let mut current_line = String::new();
        for word in &words {
            let candidate = if current_line.is_empty() {
                word.to_string()
            } else {
                format!("{} {}", current_line, word)
            };
            let w = measure.text_width(&candidate, font_size, bold);
            if w > max_width && !current_line.is_empty() {
                lines.push(current_line);
                current_line = word.to_string();
            } else {
                current_line = candidate;
            }
        }
        if !current_line.is_empty() {
            lines.push(current_line);
        }
    }

    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        if measure.text_width(&line, font_size, bold) > max_width {
            out.extend(wrap_chars(&line, font_size, bold, max_width, measure));
        } else {
            out.push(line);
        }
    }
    if out.is_empty() {
        out.push(String::new());
    }
    out
}

/// Character-by-character wrapping; every line holds at least one character.
fn wrap_chars(
    line: &str,
    font_size: f32,
    bold: bool,
    max_width: f32,
    measure: &dyn TextMeasure,
) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in line.chars() {
        current.push(ch);
        if measure.text_width(&current, font_size, bold) > max_width && current.chars().count() > 1 {
            current.pop();
            out.push(std::mem::take(&mut current).trim_end().to_string());
            if !ch.is_whitespace() {
                current.push(ch);
            }
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_text_width() {
        let mgr = FontManager::default();
        let w = mgr.text_width("Hello", 16.0, false);
        // 5 chars × 16 × 0.5 = 40
        assert!((w - 40.0).abs() < 0.1);
    }

    #[test]
    fn cjk_characters_are_full_width() {
        let mgr = FontManager::default();
        assert!((mgr.text_width("中文", 10.0, false) - 20.0).abs() < 0.01);
        assert!(is_wide('あ') && !is_wide('a'));
    }

    #[test]
    fn word_wrap_basic() {
        let mgr = FontManager::default();
        let lines = wrap_text("Hello world foo bar", 16.0, false, 60.0, &mgr);
        assert!(lines.len() >= 2, "Expected wrapping, got {:?}", lines);
    }

    #[test]
    fn unbroken_script_wraps_per_character() {
        let mgr = FontManager::default();
        // 12 ideographs at 10pt are 120pt wide; 35pt fits 3 per line.
        let lines = wrap_text("一二三四五六七八九十百千", 10.0, false, 35.0, &mgr);
        assert_eq!(lines.len(), 4);
        assert!(lines
            .iter()
            .all(|l| mgr.text_width(l, 10.0, false) <= 35.0));
        assert_eq!(lines.concat(), "一二三四五六七八九十百千");
    }

    #[test]
    fn explicit_newlines_are_kept() {
        let mgr = FontManager::default();
        let lines = wrap_text("a\n\nb", 10.0, false, 100.0, &mgr);
        assert_eq!(lines, vec!["a", "", "b"]);
    }

    #[test]
    fn invalid_font_bytes_are_rejected() {
        assert!(FontData::parse(Arc::new(vec![0, 1, 2, 3])).is_err());
        assert!(FontManager::new().font().is_none());
    }
}
