//! Label classes and their PNG palettes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Colour name turning a class into the palette transparency index
pub const TRANSPARENT: &str = "transparent";

/// Indexed PNG palettes hold at most 256 entries
pub const MAX_PALETTE_COLORS: usize = 256;

/// CSS3 colour keywords
const CSS3_COLORS: &[(&str, u32)] = &[
    ("aliceblue", 0xf0f8ff),
    ("antiquewhite", 0xfaebd7),
    ("aqua", 0x00ffff),
    ("aquamarine", 0x7fffd4),
    ("azure", 0xf0ffff),
    ("beige", 0xf5f5dc),
    ("bisque", 0xffe4c4),
    ("black", 0x000000),
    ("blanchedalmond", 0xffebcd),
    ("blue", 0x0000ff),
    ("blueviolet", 0x8a2be2),
    ("brown", 0xa52a2a),
    ("burlywood", 0xdeb887),
    ("cadetblue", 0x5f9ea0),
    ("chartreuse", 0x7fff00),
    ("chocolate", 0xd2691e),
    ("coral", 0xff7f50),
    ("cornflowerblue", 0x6495ed),
    ("cornsilk", 0xfff8dc),
    ("crimson", 0xdc143c),
    ("cyan", 0x00ffff),
    ("darkblue", 0x00008b),
    ("darkcyan", 0x008b8b),
    ("darkgoldenrod", 0xb8860b),
    ("darkgray", 0xa9a9a9),
    ("darkgreen", 0x006400),
    ("darkgrey", 0xa9a9a9),
    ("darkkhaki", 0xbdb76b),
    ("darkmagenta", 0x8b008b),
    ("darkolivegreen", 0x556b2f),
    ("darkorange", 0xff8c00),
    ("darkorchid", 0x9932cc),
    ("darkred", 0x8b0000),
    ("darksalmon", 0xe9967a),
    ("darkseagreen", 0x8fbc8f),
    ("darkslateblue", 0x483d8b),
    ("darkslategray", 0x2f4f4f),
    ("darkslategrey", 0x2f4f4f),
    ("darkturquoise", 0x00ced1),
    ("darkviolet", 0x9400d3),
    ("deeppink", 0xff1493),
    ("deepskyblue", 0x00bfff),
    ("dimgray", 0x696969),
    ("dimgrey", 0x696969),
    ("dodgerblue", 0x1e90ff),
    ("firebrick", 0xb22222),
    ("floralwhite", 0xfffaf0),
    ("forestgreen", 0x228b22),
    ("fuchsia", 0xff00ff),
    ("gainsboro", 0xdcdcdc),
    ("ghostwhite", 0xf8f8ff),
    ("gold", 0xffd700),
    ("goldenrod", 0xdaa520),
    ("gray", 0x808080),
    ("green", 0x008000),
    ("greenyellow", 0xadff2f),
    ("grey", 0x808080),
    ("honeydew", 0xf0fff0),
    ("hotpink", 0xff69b4),
    ("indianred", 0xcd5c5c),
    ("indigo", 0x4b0082),
    ("ivory", 0xfffff0),
    ("khaki", 0xf0e68c),
    ("lavender", 0xe6e6fa),
    ("lavenderblush", 0xfff0f5),
    ("lawngreen", 0x7cfc00),
    ("lemonchiffon", 0xfffacd),
    ("lightblue", 0xadd8e6),
    ("lightcoral", 0xf08080),
    ("lightcyan", 0xe0ffff),
    ("lightgoldenrodyellow", 0xfafad2),
    ("lightgray", 0xd3d3d3),
    ("lightgreen", 0x90ee90),
    ("lightgrey", 0xd3d3d3),
    ("lightpink", 0xffb6c1),
    ("lightsalmon", 0xffa07a),
    ("lightseagreen", 0x20b2aa),
    ("lightskyblue", 0x87cefa),
    ("lightslategray", 0x778899),
    ("lightslategrey", 0x778899),
    ("lightsteelblue", 0xb0c4de),
    ("lightyellow", 0xffffe0),
    ("lime", 0x00ff00),
    ("limegreen", 0x32cd32),
    ("linen", 0xfaf0e6),
    ("magenta", 0xff00ff),
    ("maroon", 0x800000),
    ("mediumaquamarine", 0x66cdaa),
    ("mediumblue", 0x0000cd),
    ("mediumorchid", 0xba55d3),
    ("mediumpurple", 0x9370db),
    ("mediumseagreen", 0x3cb371),
    ("mediumslateblue", 0x7b68ee),
    ("mediumspringgreen", 0x00fa9a),
    ("mediumturquoise", 0x48d1cc),
    ("mediumvioletred", 0xc71585),
    ("midnightblue", 0x191970),
    ("mintcream", 0xf5fffa),
    ("mistyrose", 0xffe4e1),
    ("moccasin", 0xffe4b5),
    ("navajowhite", 0xffdead),
    ("navy", 0x000080),
    ("oldlace", 0xfdf5e6),
    ("olive", 0x808000),
    ("olivedrab", 0x6b8e23),
    ("orange", 0xffa500),
    ("orangered", 0xff4500),
    ("orchid", 0xda70d6),
    ("palegoldenrod", 0xeee8aa),
    ("palegreen", 0x98fb98),
    ("paleturquoise", 0xafeeee),
    ("palevioletred", 0xdb7093),
    ("papayawhip", 0xffefd5),
    ("peachpuff", 0xffdab9),
    ("peru", 0xcd853f),
    ("pink", 0xffc0cb),
    ("plum", 0xdda0dd),
    ("powderblue", 0xb0e0e6),
    ("purple", 0x800080),
    ("red", 0xff0000),
    ("rosybrown", 0xbc8f8f),
    ("royalblue", 0x4169e1),
    ("saddlebrown", 0x8b4513),
    ("salmon", 0xfa8072),
    ("sandybrown", 0xf4a460),
    ("seagreen", 0x2e8b57),
    ("seashell", 0xfff5ee),
    ("sienna", 0xa0522d),
    ("silver", 0xc0c0c0),
    ("skyblue", 0x87ceeb),
    ("slateblue", 0x6a5acd),
    ("slategray", 0x708090),
    ("slategrey", 0x708090),
    ("snow", 0xfffafa),
    ("springgreen", 0x00ff7f),
    ("steelblue", 0x4682b4),
    ("tan", 0xd2b48c),
    ("teal", 0x008080),
    ("thistle", 0xd8bfd8),
    ("tomato", 0xff6347),
    ("turquoise", 0x40e0d0),
    ("violet", 0xee82ee),
    ("wheat", 0xf5deb3),
    ("white", 0xffffff),
    ("whitesmoke", 0xf5f5f5),
    ("yellow", 0xffff00),
    ("yellowgreen", 0x9acd32),
];

/// Parse a `#RRGGBB` value, a CSS3 colour name or `transparent` (as white).
pub fn parse_color(color: &str) -> Result<[u8; 3]> {
    let invalid = || Error::Config(format!("Invalid color: {}", color));

    if let Some(hex) = color.strip_prefix('#') {
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let value = u32::from_str_radix(hex, 16).map_err(|_| invalid())?;
        return Ok(rgb(value));
    }

    let name = color.to_ascii_lowercase();
    let name = if name == TRANSPARENT { "white" } else { name.as_str() };

    CSS3_COLORS
        .iter()
        .find(|(css, _)| *css == name)
        .map(|(_, value)| rgb(*value))
        .ok_or_else(invalid)
}

fn rgb(value: u32) -> [u8; 3] {
    [(value >> 16) as u8, (value >> 8) as u8, value as u8]
}

/// Opposite hue, same saturation and value.
///
/// Works on 0-255 channels and truncates, so it is not an exact involution.
pub fn complementary_color([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (r as f64, g as f64, b as f64);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);

    if max == min {
        return [max as u8; 3];
    }

    let s = (max - min) / max;
    let v = max;
    let (rc, gc, bc) = ((max - r) / (max - min), (max - g) / (max - min), (max - b) / (max - min));
    let h = if r == max {
        bc - gc
    } else if g == max {
        2.0 + rc - bc
    } else {
        4.0 + gc - rc
    };
    let h = ((h / 6.0).rem_euclid(1.0) + 0.5).rem_euclid(1.0);

    let i = (h * 6.0).floor();
    let f = h * 6.0 - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));

    let (r, g, b) = match i as i64 % 6 {
        0 => (v, t, p),
        1 => (q, v, p),
        2 => (p, v, t),
        3 => (p, q, v),
        4 => (t, p, v),
        _ => (v, p, q),
    };

    [r as u8, g as u8, b as u8]
}

/// Colour table of a paletted label, with its optional transparent index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    colors: Vec<[u8; 3]>,
    transparency: Option<u8>,
}

impl Palette {
    /// Build a palette from class colours, in class order.
    ///
    /// The first `transparent` colour sets the transparency index.
    pub fn from_colors<S: AsRef<str>>(colors: &[S]) -> Result<Self> {
        if colors.is_empty() || colors.len() >= MAX_PALETTE_COLORS {
            return Err(Error::Config(format!(
                "A palette needs between 1 and {} colors, got {}",
                MAX_PALETTE_COLORS - 1,
                colors.len()
            )));
        }

        let transparency = colors
            .iter()
            .position(|c| c.as_ref().eq_ignore_ascii_case(TRANSPARENT))
            .map(|i| i as u8);

        let colors = colors
            .iter()
            .map(|c| parse_color(c.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            colors,
            transparency,
        })
    }

    /// Same palette with every colour replaced by its complementary one
    pub fn complementary(&self) -> Self {
        Self {
            colors: self.colors.iter().copied().map(complementary_color).collect(),
            transparency: self.transparency,
        }
    }

    pub fn colors(&self) -> &[[u8; 3]] {
        &self.colors
    }

    pub fn transparency(&self) -> Option<u8> {
        self.transparency
    }

    /// Flat RGB bytes, padded with black to `entries` colours
    pub fn to_rgb_bytes(&self, entries: usize) -> Vec<u8> {
        let mut bytes: Vec<u8> = self.colors.iter().flatten().copied().collect();
        bytes.resize(entries.max(self.colors.len()) * 3, 0);
        bytes
    }
}

/// One label class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassConfig {
    pub title: String,
    pub color: String,
}

/// The `[[classes]]` tables of a TOML configuration file.
///
/// ```toml
/// [[classes]]
/// title = "background"
/// color = "transparent"
///
/// [[classes]]
/// title = "building"
/// color = "#ff00ff"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassesConfig {
    #[serde(default)]
    pub classes: Vec<ClassConfig>,
}

impl ClassesConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ClassesConfig = toml::from_str(contents)
            .map_err(|e| Error::Config(format!("Invalid classes config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// At least two classes, each titled and with a valid colour
    pub fn validate(&self) -> Result<()> {
        if self.classes.len() < 2 {
            return Err(Error::Config("At least 2 classes are mandatory".to_string()));
        }

        for class in &self.classes {
            if class.title.is_empty() {
                return Err(Error::Config("Missing or empty classes.title value".to_string()));
            }
            parse_color(&class.color)?;
        }

        Ok(())
    }

    /// Palette of the class colours, complementary for label display if asked
    pub fn palette(&self, complementary: bool) -> Result<Palette> {
        let colors: Vec<&str> = self.classes.iter().map(|c| c.color.as_str()).collect();
        let palette = Palette::from_colors(&colors)?;
        Ok(if complementary {
            palette.complementary()
        } else {
            palette
        })
    }

    /// Burn value of a class: its index in the class list, never 0.
    pub fn burn_value(&self, title: &str) -> Result<u8> {
        let index = self
            .classes
            .iter()
            .position(|c| c.title == title)
            .ok_or_else(|| {
                Error::Config(format!("Class '{}' is not in the classes config", title))
            })?;

        match u8::try_from(index) {
            Ok(value) if value > 0 => Ok(value),
            _ => Err(Error::Config(format!(
                "Class '{}' has index {}, burn values must be in 1..=255",
                title, index
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r##"
[[classes]]
title = "background"
color = "transparent"

[[classes]]
title = "building"
color = "deeppink"

[[classes]]
title = "road"
color = "#00FF00"
"##;

    #[test]
    fn test_parse_color() {
        assert_eq!(parse_color("#ff8000").unwrap(), [255, 128, 0]);
        assert_eq!(parse_color("DeepPink").unwrap(), [255, 20, 147]);
        assert_eq!(parse_color("transparent").unwrap(), [255, 255, 255]);
        assert!(parse_color("#ff80").is_err());
        assert!(parse_color("#gg0000").is_err());
        assert!(parse_color("notacolor").is_err());
    }

    #[test]
    fn test_css_table_complete() {
        assert_eq!(CSS3_COLORS.len(), 147);
        assert!(CSS3_COLORS.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_complementary_color() {
        assert_eq!(complementary_color([255, 0, 0]), [0, 255, 255]);
        assert_eq!(complementary_color([0, 0, 255]), [255, 254, 0]);
        assert_eq!(complementary_color([128, 128, 128]), [128, 128, 128]);
        assert_eq!(complementary_color([255, 20, 147]), [20, 255, 128]);
    }

    #[test]
    fn test_palette_transparency() {
        let palette = Palette::from_colors(&["white", "Transparent", "red"]).unwrap();
        assert_eq!(palette.transparency(), Some(1));
        assert_eq!(palette.colors()[1], [255, 255, 255]);

        let bytes = palette.to_rgb_bytes(256);
        assert_eq!(bytes.len(), 768);
        assert_eq!(&bytes[6..9], &[255, 0, 0]);
    }

    #[test]
    fn test_palette_rejects_empty() {
        let none: [&str; 0] = [];
        assert!(Palette::from_colors(&none).is_err());
    }

    #[test]
    fn test_classes_config() {
        let config = ClassesConfig::from_toml_str(CONFIG).unwrap();
        assert_eq!(config.classes.len(), 3);
        assert_eq!(config.burn_value("building").unwrap(), 1);
        assert_eq!(config.burn_value("road").unwrap(), 2);
        assert!(config.burn_value("background").is_err());
        assert!(config.burn_value("water").is_err());

        let palette = config.palette(true).unwrap();
        assert_eq!(palette.transparency(), Some(0));
        assert_eq!(palette.colors()[2], [255, 0, 255]);
    }

    #[test]
    fn test_classes_config_needs_two_classes() {
        let single = "[[classes]]\ntitle = \"only\"\ncolor = \"red\"\n";
        assert!(matches!(
            ClassesConfig::from_toml_str(single),
            Err(Error::Config(_))
        ));

        let bad_color = "[[classes]]\ntitle = \"a\"\ncolor = \"red\"\n[[classes]]\ntitle = \"b\"\ncolor = \"nope\"\n";
        assert!(ClassesConfig::from_toml_str(bad_color).is_err());
    }
}
