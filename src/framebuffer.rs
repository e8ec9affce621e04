use embedded_graphics::{
    draw_target::DrawTarget,
    geometry::{Dimensions, OriginDimensions, Size},
    pixelcolor::{raw::RawU16, Rgb565},
    prelude::*,
    primitives::Rectangle,
    Pixel,
};

/// Physical panel dimensions (portrait, native).
pub const PANEL_WIDTH: u32 = 320;
pub const PANEL_HEIGHT: u32 = 480;

/// Number of panel rows copied per transfer; bounds the DMA bounce buffer.
pub const CHUNK_LINES: i32 = 20;

/// Logical framebuffer dimensions for a given rotation (90° steps).
pub fn dims(rotation: u8) -> (u32, u32) {
    if rotation & 1 == 0 {
        (PANEL_WIDTH, PANEL_HEIGHT)
    } else {
        (PANEL_HEIGHT, PANEL_WIDTH)
    }
}

/// RGB565 framebuffer backed by a PSRAM allocation. The panel's transfer
/// engine cannot read PSRAM directly, so flushes go row-chunk by row-chunk
/// through a small internal-memory DMA buffer.
pub struct Framebuffer {
    buf: *mut u16,
    len: usize,
    width: u32,
    height: u32,
    dma_buf: *mut u8,
    dma_bytes: usize,
}

impl Framebuffer {
    pub fn new(rotation: u8) -> Self {
        let (width, height) = dims(rotation);
        let pixels = (width * height) as usize;
        let bytes = pixels * core::mem::size_of::<u16>();
        let ptr = unsafe {
            esp_idf_sys::heap_caps_malloc(bytes, esp_idf_sys::MALLOC_CAP_SPIRAM) as *mut u16
        };
        assert!(!ptr.is_null(), "PSRAM framebuffer alloc failed ({} bytes)", bytes);
        unsafe {
            core::ptr::write_bytes(ptr, 0, pixels);
        }

        let dma_pixels = (PANEL_WIDTH as usize) * (CHUNK_LINES as usize);
        let dma_bytes = dma_pixels * 2;
        let dma_buf = unsafe {
            esp_idf_sys::heap_caps_malloc(
                dma_bytes,
                esp_idf_sys::MALLOC_CAP_DMA
                    | esp_idf_sys::MALLOC_CAP_INTERNAL
                    | esp_idf_sys::MALLOC_CAP_8BIT,
            ) as *mut u8
        };
        assert!(!dma_buf.is_null(), "DMA buffer alloc failed ({} bytes)", dma_bytes);

        Self {
            buf: ptr,
            len: pixels,
            width,
            height,
            dma_buf,
            dma_bytes,
        }
    }

    fn as_slice(&self) -> &[u16] {
        unsafe { core::slice::from_raw_parts(self.buf, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u16] {
        unsafe { core::slice::from_raw_parts_mut(self.buf, self.len) }
    }

    pub fn clear_color(&mut self, color: Rgb565) {
        let raw = RawU16::from(color).into_inner();
        self.as_mut_slice().fill(raw);
    }

    /// Flush the framebuffer to the native-portrait panel.
    ///
    /// The rotation maps screen coords to panel coords the same way the
    /// touch remap does, so display and input stay aligned:
    /// panel(px, py) reads fb(x, y) with
    ///   rot 0: x = px,       y = py
    ///   rot 1: x = py,       y = W-1-px
    ///   rot 2: x = W-1-px,   y = H-1-py
    ///   rot 3: x = H-1-py,   y = px
    /// where W/H are the native panel width/height. Pixels go out
    /// big-endian, at most CHUNK_LINES rows per transfer; the buffer is
    /// the caller's again as soon as this returns.
    pub fn flush_to_panel(&self, panel: esp_idf_sys::esp_lcd_panel_handle_t, rotation: u8) {
        let dma_slice = unsafe { core::slice::from_raw_parts_mut(self.dma_buf, self.dma_bytes) };
        let fb = self.as_slice();
        let fb_w = self.width as usize;

        let pw = PANEL_WIDTH as i32;
        let ph = PANEL_HEIGHT as i32;
        let w1 = PANEL_WIDTH as usize - 1;
        let h1 = PANEL_HEIGHT as usize - 1;

        let mut py = 0i32;
        while py < ph {
            let py_end = (py + CHUNK_LINES).min(ph);

            let mut di = 0usize;
            for row in py..py_end {
                let row = row as usize;
                for px in 0..pw as usize {
                    let (x, y) = match rotation & 3 {
                        0 => (px, row),
                        1 => (row, w1 - px),
                        2 => (w1 - px, h1 - row),
                        _ => (h1 - row, px),
                    };
                    let pixel = fb[y * fb_w + x];
                    dma_slice[di] = (pixel >> 8) as u8;
                    dma_slice[di + 1] = (pixel & 0xFF) as u8;
                    di += 2;
                }
            }

            unsafe {
                esp_idf_sys::esp_lcd_panel_draw_bitmap(
                    panel,
                    0,
                    py,
                    pw,
                    py_end,
                    dma_slice.as_ptr().cast(),
                );
            }

            py = py_end;
        }
    }
}

impl OriginDimensions for Framebuffer {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for Framebuffer {
    type Color = Rgb565;
    type Error = core::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let w = self.width;
        let h = self.height;
        let buf = self.as_mut_slice();
        for Pixel(point, color) in pixels {
            let x = point.x;
            let y = point.y;
            if x >= 0 && y >= 0 && (x as u32) < w && (y as u32) < h {
                let idx = (y as u32 * w + x as u32) as usize;
                buf[idx] = RawU16::from(color).into_inner();
            }
        }
        Ok(())
    }

    fn fill_solid(&mut self, area: &Rectangle, color: Self::Color) -> Result<(), Self::Error> {
        let raw = RawU16::from(color).into_inner();
        let display = self.bounding_box();
        let area = area.intersection(&display);
        let w = self.width;
        let buf = self.as_mut_slice();
        for y in area.rows() {
            let row_start = (y as u32 * w) as usize;
            for x in area.columns() {
                buf[row_start + x as usize] = raw;
            }
        }
        Ok(())
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            esp_idf_sys::heap_caps_free(self.buf.cast());
            esp_idf_sys::heap_caps_free(self.dma_buf.cast());
        }
    }
}
