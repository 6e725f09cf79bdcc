//! `§` formatting codes used in MOTDs

pub const FORMAT_CHAR: char = '§';

const WHITE: [u8; 3] = [255, 255, 255];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextStyle(u8);

impl TextStyle {
    const BOLD: u8 = 1 << 1;
    const ITALIC: u8 = 1 << 2;
    const OBFUSCATED: u8 = 1 << 3;

    pub fn bold(self) -> bool {
        self.0 & Self::BOLD != 0
    }

    pub fn italic(self) -> bool {
        self.0 & Self::ITALIC != 0
    }

    pub fn obfuscated(self) -> bool {
        self.0 & Self::OBFUSCATED != 0
    }
}

/// A run of text sharing one colour and style
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub color: [u8; 3],
    pub style: TextStyle,
    pub text: String,
}

fn color_for(code: char) -> Option<[u8; 3]> {
    let rgb = match code {
        '0' => [0, 0, 0],
        '1' => [0, 0, 170],
        '2' => [0, 170, 0],
        '3' => [0, 170, 170],
        '4' => [170, 0, 0],
        '5' => [170, 0, 170],
        '6' => [255, 170, 0],
        '7' => [198, 198, 198],
        '8' => [85, 85, 85],
        '9' => [85, 85, 255],
        'a' => [85, 255, 85],
        'b' => [85, 255, 255],
        'c' => [255, 85, 85],
        'd' => [255, 85, 255],
        'e' => [255, 255, 85],
        'f' => WHITE,
        'g' => [221, 214, 5],
        'h' => [227, 212, 209],
        'i' => [206, 202, 202],
        'j' => [68, 58, 59],
        'm' => [51, 22, 7],
        'n' => [180, 104, 77],
        'p' => [222, 177, 45],
        'q' => [17, 159, 54],
        's' => [44, 186, 168],
        't' => [33, 73, 123],
        'u' => [154, 92, 198],
        'v' => [235, 114, 20],
        _ => return None,
    };
    Some(rgb)
}

/// Split text into styled spans
///
/// Colours and styles carry over until changed; `§r` resets both. Empty
/// spans are dropped.
pub fn parse_formatted(s: &str) -> Vec<TextSpan> {
    let mut spans = Vec::new();
    let mut color = WHITE;
    let mut style = TextStyle::default();

    for (i, part) in s.split(FORMAT_CHAR).enumerate() {
        if i == 0 {
            if !part.is_empty() {
                spans.push(TextSpan {
                    color,
                    style,
                    text: part.to_string(),
                });
            }
            continue;
        }

        let mut chars = part.chars();
        let Some(code) = chars.next() else {
            continue;
        };
        match code {
            'k' => style.0 |= TextStyle::OBFUSCATED,
            'l' => style.0 |= TextStyle::BOLD,
            'o' => style.0 |= TextStyle::ITALIC,
            'r' => {
                style = TextStyle::default();
                color = WHITE;
            }
            c => {
                if let Some(rgb) = color_for(c) {
                    color = rgb;
                }
            }
        }

        let text = chars.as_str();
        if !text.is_empty() {
            spans.push(TextSpan {
                color,
                style,
                text: text.to_string(),
            });
        }
    }
    spans
}

/// Plain text with all formatting codes removed
pub fn strip_formatting(s: &str) -> String {
    parse_formatted(s).into_iter().map(|span| span.text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text() {
        let spans = parse_formatted("Hello");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].color, WHITE);
        assert_eq!(spans[0].text, "Hello");
    }

    #[test]
    fn test_color_and_style_carry_over() {
        let spans = parse_formatted("§bThe §lHive§r!");
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].text, "The ");
        assert_eq!(spans[0].color, [85, 255, 255]);
        assert!(!spans[0].style.bold());

        assert_eq!(spans[1].text, "Hive");
        assert_eq!(spans[1].color, [85, 255, 255]);
        assert!(spans[1].style.bold());

        assert_eq!(spans[2].text, "!");
        assert_eq!(spans[2].color, WHITE);
        assert!(!spans[2].style.bold());
    }

    #[test]
    fn test_strip_formatting() {
        assert_eq!(strip_formatting("§a§lCube§fCraft §7Games"), "CubeCraft Games");
        assert_eq!(strip_formatting("§"), "");
    }
}
