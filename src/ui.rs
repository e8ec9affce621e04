use embedded_graphics::{
    mono_font::MonoTextStyle,
    pixelcolor::Rgb565,
    prelude::*,
    primitives::{PrimitiveStyleBuilder, Rectangle, RoundedRectangle},
    text::{Alignment, Text},
};
use profont::{PROFONT_10_POINT, PROFONT_12_POINT, PROFONT_14_POINT, PROFONT_24_POINT};

use crate::framebuffer::Framebuffer;
use crate::pipeline::PipelineState;

/// Convert 8-bit RGB to Rgb565.
pub const fn rgb(r: u8, g: u8, b: u8) -> Rgb565 {
    Rgb565::new(r >> 3, g >> 2, b >> 3)
}

pub const BG: Rgb565 = rgb(22, 28, 38);
pub const LINE_COLOR: Rgb565 = rgb(56, 63, 76);
pub const CARD_FILL: Rgb565 = rgb(20, 25, 35);
pub const CARD_BORDER: Rgb565 = rgb(63, 75, 95);
pub const ZONE_FILL: Rgb565 = rgb(28, 38, 52);
pub const ZONE_FILL_BUSY: Rgb565 = rgb(52, 34, 28);

pub const TEXT_HEADER: Rgb565 = rgb(222, 225, 230);
pub const TEXT_STATUS: Rgb565 = rgb(182, 187, 196);
pub const TEXT_PRIMARY: Rgb565 = rgb(232, 235, 240);
pub const TEXT_SECONDARY: Rgb565 = rgb(188, 196, 208);
pub const TEXT_BOTTOM: Rgb565 = rgb(140, 148, 160);
pub const TEXT_ACCENT: Rgb565 = rgb(166, 208, 255);
pub const TEXT_ERROR: Rgb565 = rgb(240, 120, 110);

pub const HEADER_LINE_Y: i32 = 30;
pub const CARD_MARGIN: i32 = 8;
pub const CARD_RADIUS: u32 = 12;

/// Height of the tap-to-talk zone at the bottom of the screen.
pub const RECORD_ZONE_H: i32 = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoMode {
    Dictation,
    Translation,
    Chat,
}

impl DemoMode {
    pub fn label(self) -> &'static str {
        match self {
            DemoMode::Dictation => "DICTATION",
            DemoMode::Translation => "TRANSLATION",
            DemoMode::Chat => "CHAT",
        }
    }

    pub fn next(self) -> Self {
        match self {
            DemoMode::Dictation => DemoMode::Translation,
            DemoMode::Translation => DemoMode::Chat,
            DemoMode::Chat => DemoMode::Dictation,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            DemoMode::Dictation => DemoMode::Chat,
            DemoMode::Translation => DemoMode::Dictation,
            DemoMode::Chat => DemoMode::Translation,
        }
    }
}

/// True if a tap at screen y lands in the record zone.
pub fn in_record_zone(y: i32, screen_h: u32) -> bool {
    y >= screen_h as i32 - RECORD_ZONE_H
}

/// Everything the main screen needs; assembled once per redraw.
pub struct UiSnapshot {
    pub device_name: String,
    pub time_text: Option<String>,
    pub wifi_ok: bool,
    pub sd_ok: bool,
    pub mode: DemoMode,
    pub state: PipelineState,
    pub transcript: String,
    pub reply: String,
    pub error: String,
    pub speaker_volume: u8,
    pub recording_pct: Option<u8>,
}

/// Fill a horizontal line across the full screen width.
pub fn draw_hline(fb: &mut Framebuffer, y: i32, color: Rgb565) {
    let style = PrimitiveStyleBuilder::new().fill_color(color).build();
    Rectangle::new(Point::new(0, y), Size::new(fb.size().width, 1))
        .into_styled(style)
        .draw(fb)
        .ok();
}

/// Draw a filled rounded rectangle with border (card style).
pub fn draw_card(fb: &mut Framebuffer, x: i32, y: i32, w: i32, h: i32, fill: Rgb565, border: Rgb565) {
    let style = PrimitiveStyleBuilder::new().fill_color(border).build();
    RoundedRectangle::with_equal_corners(
        Rectangle::new(Point::new(x, y), Size::new(w as u32, h as u32)),
        Size::new(CARD_RADIUS, CARD_RADIUS),
    )
    .into_styled(style)
    .draw(fb)
    .ok();

    let inner_style = PrimitiveStyleBuilder::new().fill_color(fill).build();
    RoundedRectangle::with_equal_corners(
        Rectangle::new(Point::new(x + 1, y + 1), Size::new((w - 2) as u32, (h - 2) as u32)),
        Size::new(CARD_RADIUS - 1, CARD_RADIUS - 1),
    )
    .into_styled(inner_style)
    .draw(fb)
    .ok();
}

/// Greedy word wrap to `max_chars` columns, at most `max_lines` lines.
/// Widths are counted in chars, not bytes: a translated reply is mostly
/// multibyte text arriving as one long whitespace-free run, which gets
/// broken across lines at char boundaries.
fn wrap_lines(text: &str, max_chars: usize, max_lines: usize) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut line = String::new();
    let mut line_chars = 0usize;
    for word in text.split_whitespace() {
        let word_chars = word.chars().count();
        if !line.is_empty() && line_chars + 1 + word_chars > max_chars {
            lines.push(std::mem::take(&mut line));
            line_chars = 0;
            if lines.len() >= max_lines {
                return lines;
            }
        }
        if !line.is_empty() {
            line.push(' ');
            line_chars += 1;
        }
        if word_chars > max_chars {
            for ch in word.chars() {
                if line_chars == max_chars {
                    lines.push(std::mem::take(&mut line));
                    line_chars = 0;
                    if lines.len() >= max_lines {
                        return lines;
                    }
                }
                line.push(ch);
                line_chars += 1;
            }
        } else {
            line.push_str(word);
            line_chars += word_chars;
        }
    }
    if !line.is_empty() && lines.len() < max_lines {
        lines.push(line);
    }
    lines
}

fn draw_wrapped(
    fb: &mut Framebuffer,
    text: &str,
    x: i32,
    mut y: i32,
    max_chars: usize,
    max_lines: usize,
    style: MonoTextStyle<Rgb565>,
) {
    for line in wrap_lines(text, max_chars, max_lines) {
        Text::new(&line, Point::new(x, y), style).draw(fb).ok();
        y += 18;
    }
}

/// Boot splash: firmware name plus a progress line.
pub fn draw_splash(fb: &mut Framebuffer, status: &str) {
    fb.clear_color(BG);
    let (w, h) = (fb.size().width as i32, fb.size().height as i32);

    let title_style = MonoTextStyle::new(&PROFONT_24_POINT, TEXT_HEADER);
    Text::with_alignment("Watt-IZ", Point::new(w / 2, h / 2 - 20), title_style, Alignment::Center)
        .draw(fb)
        .ok();

    let status_style = MonoTextStyle::new(&PROFONT_12_POINT, TEXT_STATUS);
    Text::with_alignment(status, Point::new(w / 2, h / 2 + 16), status_style, Alignment::Center)
        .draw(fb)
        .ok();
}

/// The single status screen: header, state line, transcript/reply cards,
/// tap-to-talk zone.
pub fn draw_main(fb: &mut Framebuffer, snap: &UiSnapshot) {
    fb.clear_color(BG);
    let (w, h) = (fb.size().width as i32, fb.size().height as i32);

    // Header: device name, time, link status
    let header_style = MonoTextStyle::new(&PROFONT_14_POINT, TEXT_HEADER);
    Text::new(&snap.device_name, Point::new(10, 22), header_style)
        .draw(fb)
        .ok();

    let status_style = MonoTextStyle::new(&PROFONT_12_POINT, TEXT_STATUS);
    let time_text = snap.time_text.as_deref().unwrap_or("--:--");
    let right = format!(
        "{} {} {}",
        if snap.wifi_ok { "wifi" } else { "~wifi" },
        if snap.sd_ok { "sd" } else { "~sd" },
        time_text
    );
    Text::with_alignment(&right, Point::new(w - 10, 22), status_style, Alignment::Right)
        .draw(fb)
        .ok();
    draw_hline(fb, HEADER_LINE_Y, LINE_COLOR);

    // Mode + state
    let mode_style = MonoTextStyle::new(&PROFONT_14_POINT, TEXT_ACCENT);
    Text::new(snap.mode.label(), Point::new(10, 56), mode_style)
        .draw(fb)
        .ok();

    let state_text = match (snap.state, snap.recording_pct) {
        (PipelineState::Recording, Some(pct)) => format!("listening... {}%", pct),
        _ => snap.state.label().to_string(),
    };
    let state_color = if snap.state == PipelineState::Failed {
        TEXT_ERROR
    } else {
        TEXT_STATUS
    };
    let state_style = MonoTextStyle::new(&PROFONT_12_POINT, state_color);
    Text::with_alignment(&state_text, Point::new(w - 10, 56), state_style, Alignment::Right)
        .draw(fb)
        .ok();

    // Transcript card
    let text_style = MonoTextStyle::new(&PROFONT_12_POINT, TEXT_PRIMARY);
    let label_style = MonoTextStyle::new(&PROFONT_10_POINT, TEXT_SECONDARY);
    let card_w = w - 2 * CARD_MARGIN;
    let card_h = (h - 70 - RECORD_ZONE_H - 24) / 2;
    let max_chars = (card_w as usize - 32) / 9; // PROFONT_12 advance

    let card1_y = 66;
    draw_card(fb, CARD_MARGIN, card1_y, card_w, card_h, CARD_FILL, CARD_BORDER);
    Text::new("you said", Point::new(CARD_MARGIN + 12, card1_y + 18), label_style)
        .draw(fb)
        .ok();
    draw_wrapped(
        fb,
        &snap.transcript,
        CARD_MARGIN + 12,
        card1_y + 40,
        max_chars,
        (card_h as usize - 48) / 18,
        text_style,
    );

    // Reply card (translation / chat answer, or the error text)
    let card2_y = card1_y + card_h + 8;
    draw_card(fb, CARD_MARGIN, card2_y, card_w, card_h, CARD_FILL, CARD_BORDER);
    let (label, body, body_color) = if snap.state == PipelineState::Failed {
        ("error", snap.error.as_str(), TEXT_ERROR)
    } else {
        ("reply", snap.reply.as_str(), TEXT_PRIMARY)
    };
    Text::new(label, Point::new(CARD_MARGIN + 12, card2_y + 18), label_style)
        .draw(fb)
        .ok();
    let body_style = MonoTextStyle::new(&PROFONT_12_POINT, body_color);
    draw_wrapped(
        fb,
        body,
        CARD_MARGIN + 12,
        card2_y + 40,
        max_chars,
        (card_h as usize - 48) / 18,
        body_style,
    );

    // Tap-to-talk zone
    let zone_y = h - RECORD_ZONE_H;
    let zone_fill = if snap.state.is_busy() { ZONE_FILL_BUSY } else { ZONE_FILL };
    draw_card(fb, CARD_MARGIN, zone_y, card_w, RECORD_ZONE_H - 8, zone_fill, CARD_BORDER);
    let zone_text = if snap.state.is_busy() { "working..." } else { "tap to talk" };
    let zone_style = MonoTextStyle::new(&PROFONT_14_POINT, TEXT_HEADER);
    Text::with_alignment(
        zone_text,
        Point::new(w / 2, zone_y + (RECORD_ZONE_H - 8) / 2 + 6),
        zone_style,
        Alignment::Center,
    )
    .draw(fb)
    .ok();

    // Bottom hint
    let hint_style = MonoTextStyle::new(&PROFONT_10_POINT, TEXT_BOTTOM);
    let hint = format!("swipe <-/-> mode   up/down vol {}%", snap.speaker_volume);
    Text::with_alignment(&hint, Point::new(w / 2, h - 2), hint_style, Alignment::Center)
        .draw(fb)
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_cycle_is_closed() {
        let mut mode = DemoMode::Dictation;
        for _ in 0..3 {
            mode = mode.next();
        }
        assert_eq!(mode, DemoMode::Dictation);
        assert_eq!(DemoMode::Dictation.prev(), DemoMode::Chat);
        assert_eq!(DemoMode::Chat.prev().next(), DemoMode::Chat);
    }

    #[test]
    fn wrap_breaks_long_words_at_char_boundaries() {
        // A translated reply: one long run of 3-byte chars mixed with ASCII,
        // no whitespace. Byte-indexed slicing would land mid-character.
        let reply = "你好世界123这是一个很长的句子没有空格456还在继续";
        let lines = wrap_lines(reply, 10, 4);
        assert_eq!(lines.len(), 3);
        for line in &lines {
            assert!(line.chars().count() <= 10);
        }
        let rejoined: String = lines.concat();
        assert_eq!(rejoined, reply);
    }

    #[test]
    fn wrap_fills_lines_greedily() {
        let lines = wrap_lines("one two three four", 9, 10);
        assert_eq!(lines, vec!["one two", "three", "four"]);
    }

    #[test]
    fn wrap_respects_line_cap() {
        let lines = wrap_lines("a b c d e f", 1, 3);
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn record_zone_is_bottom_strip() {
        assert!(!in_record_zone(0, 480));
        assert!(!in_record_zone(480 - RECORD_ZONE_H - 1, 480));
        assert!(in_record_zone(480 - RECORD_ZONE_H, 480));
        assert!(in_record_zone(479, 480));
    }
}
