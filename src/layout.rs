//!
//! src/layout.rs
//!
//! Fixed story geometry. Every position is an absolute pixel constant on a
//! 1080x1920 canvas; nothing is measured from rendered text.
//!

pub const CANVAS_W: u32 = 1080;
pub const CANVAS_H: u32 = 1920;
pub const BG_COLOR: [u8; 3] = [0x00, 0x35, 0x7A];

pub const TITLE_LINE1: &str = "last week's";
pub const TITLE_LINE2: &str = "On repeat";
pub const TITLE_LINE1_POS: (i32, i32) = (346, 225);
pub const TITLE_LINE2_POS: (i32, i32) = (108, 225);
pub const TITLE_COLOR: [u8; 4] = [255, 255, 255, 255];

// Shadow under line 2: offset copy, blurred, composited beneath
pub const SHADOW_OFFSET: (i32, i32) = (6, 6);
pub const SHADOW_COLOR: [u8; 4] = [0, 0, 0, 160];
pub const SHADOW_BLUR_SIGMA: f32 = 8.0;
pub const SHADOW_BAND_H: u32 = 600;

pub const COVER_SIZE: (u32, u32) = (172, 172);
pub const COVER_RADIUS: u32 = 30;
pub const COVER_X: i32 = 165;
pub const COVER_Y_START: i32 = 598;
pub const COVER_Y_STEP: i32 = 242; // 172px tall + 70px spacing
pub const PLACEHOLDER_COLOR: [u8; 3] = [0x1F, 0x4E, 0x8C];

pub const TEXT_X_OFFSET: i32 = 70;
pub const SONG_Y_OFFSET: i32 = 20;
pub const ARTIST_Y_OFFSET: i32 = 70;
pub const SONG_COLOR: [u8; 4] = [255, 255, 255, 255];
pub const ARTIST_COLOR: [u8; 4] = [200, 200, 200, 255];
pub const MAX_TITLE_CHARS: usize = 24;

pub const MAX_ROWS: usize = 5;

/// Font file and em size in pixels for each text role
#[derive(Debug, Clone, Copy)]
pub struct FontSpec {
    pub file: &'static str,
    pub px: f32
}

pub const FONT_LINE1: FontSpec = FontSpec { file: "TheSeasons-Regular.ttf", px: 50.0 };
pub const FONT_LINE2: FontSpec = FontSpec { file: "BurguesScript-Bold.ttf", px: 163.0 };
pub const FONT_SONG: FontSpec = FontSpec { file: "Arial.ttf", px: 40.0 };
pub const FONT_ARTIST: FontSpec = FontSpec { file: "Arial.ttf", px: 32.0 };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowPlacement {
    pub index: usize,
    pub cover_x: i32,
    pub cover_y: i32,
    pub text_x: i32,
    pub song_y: i32,
    pub artist_y: i32
}

/// Row slots for `count` tracks, never more than MAX_ROWS
pub fn plan_rows(count: usize) -> Vec<RowPlacement> {
    (0..count.min(MAX_ROWS))
        .map(|index| {
            let cover_y = COVER_Y_START + index as i32 * COVER_Y_STEP;
            RowPlacement {
                index,
                cover_x: COVER_X,
                cover_y,
                text_x: COVER_X + COVER_SIZE.0 as i32 + TEXT_X_OFFSET,
                song_y: cover_y + SONG_Y_OFFSET,
                artist_y: cover_y + ARTIST_Y_OFFSET
            }
        })
        .collect()
}

/// Cuts to MAX_TITLE_CHARS characters; shorter titles come back as-is
pub fn truncate_title(title: &str) -> &str {
    match title.char_indices().nth(MAX_TITLE_CHARS) {
        Some((cut, _)) => &title[..cut],
        None => title
    }
}
