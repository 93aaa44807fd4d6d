//!
//! src/compose.rs
//!
//! Renders the story: background, two title lines (one with a blurred drop
//! shadow), and a rounded cover + song/artist text per track row
//!

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
    imageops::{self, FilterType},
    DynamicImage, ImageEncoder, Rgba, RgbaImage
};
use rusttype::{point, Font, Scale};
use tracing::{debug, info, warn};

use crate::errors::StoryError;
use crate::layout::{self, FontSpec, RowPlacement};
use crate::sink::write_atomic;
use crate::types::{CoverArt, TrackRecord};

pub const JPEG_QUALITY: u8 = 95;

/// Searched in order when a layout font file cannot be opened
const FALLBACK_FONT_PATHS: [&str; 6] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

pub struct Face {
    font: Font<'static>,
    scale: Scale
}

impl Face {
    fn new(font: Font<'static>, em_px: f32) -> Self {
        let scale = em_scale(&font, em_px);
        Self { font, scale }
    }
}

/// rusttype scales by ascent-descent height; layout sizes are em sizes
fn em_scale(font: &Font<'static>, em_px: f32) -> Scale {
    let v = font.v_metrics_unscaled();
    let units = f32::from(font.units_per_em().max(1));
    let height = v.ascent - v.descent;
    if height <= 0.0 {
        return Scale::uniform(em_px);
    }
    Scale::uniform(em_px * height / units)
}

fn read_font(path: &Path) -> Option<Font<'static>> {
    let bytes = std::fs::read(path).ok()?;
    Font::try_from_vec(bytes)
}

/// Last resort face, compiled into the binary
const BUILTIN_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");

fn builtin_font() -> Result<Font<'static>, StoryError> {
    Font::try_from_bytes(BUILTIN_FONT)
        .ok_or_else(|| StoryError::Font("built-in DejaVuSans is not a valid font".to_string()))
}

///
/// Opens `spec` from `dir`. On failure strict mode errors out; otherwise the
/// first readable `fallbacks` entry is substituted, then the built-in face.
/// Positions are never adjusted for the substitute.
///
fn load_face(
    dir: &Path,
    spec: FontSpec,
    strict: bool,
    fallbacks: &[&str]
) -> Result<Face, StoryError> {
    let path = dir.join(spec.file);
    if let Some(font) = read_font(&path) {
        debug!(font = %path.display(), px = spec.px, "compose.font.loaded");
        return Ok(Face::new(font, spec.px));
    }
    if strict {
        return Err(StoryError::Font(format!("cannot load {}", path.display())));
    }
    for candidate in fallbacks {
        if let Some(font) = read_font(Path::new(candidate)) {
            warn!(
                wanted = %path.display(),
                substitute = candidate,
                "compose.font.fallback"
            );
            return Ok(Face::new(font, spec.px));
        }
    }
    warn!(wanted = %path.display(), substitute = "builtin", "compose.font.fallback");
    Ok(Face::new(builtin_font()?, spec.px))
}

pub struct Fonts {
    pub line1: Face,
    pub line2: Face,
    pub song: Face,
    pub artist: Face
}

impl Fonts {
    pub fn load(dir: &Path, strict: bool) -> Result<Self, StoryError> {
        Self::load_with(dir, strict, &FALLBACK_FONT_PATHS)
    }

    fn load_with(dir: &Path, strict: bool, fallbacks: &[&str]) -> Result<Self, StoryError> {
        Ok( Self {
            line1: load_face(dir, layout::FONT_LINE1, strict, fallbacks)?,
            line2: load_face(dir, layout::FONT_LINE2, strict, fallbacks)?,
            song: load_face(dir, layout::FONT_SONG, strict, fallbacks)?,
            artist: load_face(dir, layout::FONT_ARTIST, strict, fallbacks)?
        })
    }

    /// Every role on the built-in face; rendering does not depend on the host
    #[cfg(test)]
    pub fn builtin() -> Self {
        let face = |spec: FontSpec| Face::new(builtin_font().unwrap(), spec.px);
        Self {
            line1: face(layout::FONT_LINE1),
            line2: face(layout::FONT_LINE2),
            song: face(layout::FONT_SONG),
            artist: face(layout::FONT_ARTIST)
        }
    }
}

/// Source-over blend of `color` at `coverage` onto `dst`
fn blend_over(dst: &mut Rgba<u8>, color: Rgba<u8>, coverage: f32) {
    let sa = (color.0[3] as f32 / 255.0) * coverage.clamp(0.0, 1.0);
    if sa <= 0.0 {
        return;
    }
    let da = dst.0[3] as f32 / 255.0;
    let out_a = sa + da * (1.0 - sa);
    for c in 0..3 {
        let sc = color.0[c] as f32;
        let dc = dst.0[c] as f32;
        dst.0[c] = ((sc * sa + dc * da * (1.0 - sa)) / out_a).round() as u8;
    }
    dst.0[3] = (out_a * 255.0).round() as u8;
}

/// Draws `text` with its ascender line at `y`
fn draw_text(img: &mut RgbaImage, face: &Face, x: i32, y: i32, color: Rgba<u8>, text: &str) {
    let v_metrics = face.font.v_metrics(face.scale);
    let origin = point(x as f32, y as f32 + v_metrics.ascent);

    for glyph in face.font.layout(text, face.scale, origin) {
        let Some(bb) = glyph.pixel_bounding_box() else {
            continue;
        };
        glyph.draw(|gx, gy, v| {
            let px = gx as i32 + bb.min.x;
            let py = gy as i32 + bb.min.y;
            if px < 0 || py < 0 {
                return;
            }
            let (px, py) = (px as u32, py as u32);
            if px >= img.width() || py >= img.height() {
                return;
            }
            blend_over(img.get_pixel_mut(px, py), color, v);
        });
    }
}

/// Text over a blurred, offset copy of itself
fn draw_text_with_shadow(
    img: &mut RgbaImage,
    face: &Face,
    (x, y): (i32, i32),
    color: Rgba<u8>,
    text: &str
) {
    let (dx, dy) = layout::SHADOW_OFFSET;
    let band_h = layout::SHADOW_BAND_H.min(img.height());
    let mut shadow = RgbaImage::new(img.width(), band_h);
    draw_text(&mut shadow, face, x + dx, y + dy, Rgba(layout::SHADOW_COLOR), text);
    let shadow = imageops::blur(&shadow, layout::SHADOW_BLUR_SIGMA);
    imageops::overlay(img, &shadow, 0, 0);
    draw_text(img, face, x, y, color, text);
}

///
/// Aspect-filling fit: take the largest centred window of the target aspect
/// from the source, then resize it to exactly w x h. Cropping first keeps
/// the resize buffer at w x h whatever the source aspect is.
///
pub fn fit_cover(img: &DynamicImage, w: u32, h: u32) -> RgbaImage {
    let (iw, ih) = (u64::from(img.width().max(1)), u64::from(img.height().max(1)));
    let (tw, th) = (u64::from(w.max(1)), u64::from(h.max(1)));
    let (cw, ch) = if iw * th > ih * tw {
        ((ih * tw / th).max(1), ih)
    } else {
        (iw, (iw * th / tw).max(1))
    };
    let left = ((iw - cw) / 2) as u32;
    let top = ((ih - ch) / 2) as u32;
    let window = img.crop_imm(left, top, cw as u32, ch as u32).to_rgba8();
    imageops::resize(&window, w, h, FilterType::Lanczos3)
}

fn rounded_rect_contains(x: i32, y: i32, w: i32, h: i32, r: i32) -> bool {
    if r <= 0 {
        return true;
    }
    if x >= r && x < w - r {
        return true;
    }
    if y >= r && y < h - r {
        return true;
    }
    let (cx, cy) = if x < r {
        if y < r {
            (r - 1, r - 1)
        } else {
            (r - 1, h - r)
        }
    } else if y < r {
        (w - r, r - 1)
    } else {
        (w - r, h - r)
    };
    let dx = x - cx;
    let dy = y - cy;
    dx * dx + dy * dy <= r * r
}

/// Copies `tile` onto `base` at (x, y) through the rounded-corner mask
fn paste_rounded(base: &mut RgbaImage, tile: &RgbaImage, x: i32, y: i32, radius: u32) {
    let (w, h) = (tile.width() as i32, tile.height() as i32);
    for ty in 0..h {
        for tx in 0..w {
            if !rounded_rect_contains(tx, ty, w, h, radius as i32) {
                continue;
            }
            let (bx, by) = (x + tx, y + ty);
            if bx < 0 || by < 0 || bx >= base.width() as i32 || by >= base.height() as i32 {
                continue;
            }
            let src = *tile.get_pixel(tx as u32, ty as u32);
            blend_over(base.get_pixel_mut(bx as u32, by as u32), src, 1.0);
        }
    }
}

fn cover_tile(cover: &CoverArt) -> Result<RgbaImage, StoryError> {
    let (w, h) = layout::COVER_SIZE;
    match cover {
        CoverArt::Local(path) => {
            let img = image::open(path).map_err(|e|
                StoryError::Image(format!("cover {}: {e}", path.display())))?;
            Ok(fit_cover(&img, w, h))
        },
        CoverArt::Missing => {
            let [r, g, b] = layout::PLACEHOLDER_COLOR;
            Ok(RgbaImage::from_pixel(w, h, Rgba([r, g, b, 255])))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png
}

impl OutputFormat {
    /// png for .png, jpeg for everything else
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("png") => OutputFormat::Png,
            _ => OutputFormat::Jpeg
        }
    }
}

pub struct Composer {
    fonts: Fonts
}

impl Composer {
    pub fn new(fonts: Fonts) -> Self {
        Self { fonts }
    }

    pub fn render(&self, tracks: &[TrackRecord]) -> Result<RgbaImage, StoryError> {
        if tracks.len() > layout::MAX_ROWS {
            warn!(
                given = tracks.len(),
                rows = layout::MAX_ROWS,
                "compose.tracks.truncated"
            );
        }

        let [r, g, b] = layout::BG_COLOR;
        let mut canvas = RgbaImage::from_pixel(
            layout::CANVAS_W, layout::CANVAS_H, Rgba([r, g, b, 255])
        );

        let (x, y) = layout::TITLE_LINE1_POS;
        draw_text(
            &mut canvas, &self.fonts.line1, x, y, Rgba(layout::TITLE_COLOR), layout::TITLE_LINE1
        );
        draw_text_with_shadow(
            &mut canvas,
            &self.fonts.line2,
            layout::TITLE_LINE2_POS,
            Rgba(layout::TITLE_COLOR),
            layout::TITLE_LINE2
        );

        for (row, track) in layout::plan_rows(tracks.len()).into_iter().zip(tracks) {
            self.render_row(&mut canvas, row, track)?;
        }
        Ok(canvas)
    }

    fn render_row(
        &self,
        canvas: &mut RgbaImage,
        row: RowPlacement,
        track: &TrackRecord
    ) -> Result<(), StoryError> {
        if track.cover == CoverArt::Missing {
            debug!(row = row.index, title = %track.title, "compose.cover.placeholder");
        }
        let tile = cover_tile(&track.cover)?;
        paste_rounded(canvas, &tile, row.cover_x, row.cover_y, layout::COVER_RADIUS);

        let title = layout::truncate_title(&track.title);
        draw_text(
            canvas, &self.fonts.song, row.text_x, row.song_y, Rgba(layout::SONG_COLOR), title
        );
        draw_text(
            canvas,
            &self.fonts.artist,
            row.text_x,
            row.artist_y,
            Rgba(layout::ARTIST_COLOR),
            &track.artist
        );
        Ok(())
    }

    /// Encodes the canvas for `format`; identical canvases give identical bytes
    pub fn encode(canvas: &RgbaImage, format: OutputFormat) -> Result<Vec<u8>, StoryError> {
        let rgb = DynamicImage::ImageRgba8(canvas.clone()).to_rgb8();
        let mut out = Cursor::new(Vec::new());
        match format {
            OutputFormat::Jpeg => {
                JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).write_image(
                    rgb.as_raw(), rgb.width(), rgb.height(), image::ExtendedColorType::Rgb8
                )?;
            },
            OutputFormat::Png => {
                PngEncoder::new(&mut out).write_image(
                    rgb.as_raw(), rgb.width(), rgb.height(), image::ExtendedColorType::Rgb8
                )?;
            }
        }
        Ok(out.into_inner())
    }

    /// Renders and writes the story to `output`, replacing any earlier one
    pub fn compose(&self, tracks: &[TrackRecord], output: &Path) -> Result<PathBuf, StoryError> {
        let canvas = self.render(tracks)?;
        let bytes = Self::encode(&canvas, OutputFormat::from_path(output))?;
        write_atomic(output, &bytes)?;
        info!(
            path = %output.display(),
            rows = tracks.len().min(layout::MAX_ROWS),
            bytes = bytes.len(),
            "compose.saved"
        );
        Ok(output.to_path_buf())
    }
}
