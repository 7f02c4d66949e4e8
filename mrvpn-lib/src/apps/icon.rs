// the pixel pipeline is exercised by the windows extractor and the tests
#![cfg_attr(not(windows), allow(dead_code))]

use base64::Engine as _;

use std::path::Path;

/// Icons larger than this are rejected, bounding the encoded payload.
pub const MAX_DIMENSION: i32 = 256;

/// Extracts the first icon of an executable as a base64-encoded PNG.
/// Any failure yields `None`; enumeration never fails on a single icon.
#[cfg(windows)]
pub fn extract(path: &Path) -> Option<String> {
    windows_impl::extract(path)
}

#[cfg(not(windows))]
pub fn extract(_path: &Path) -> Option<String> {
    None
}

/// Converts a 32-bit top-down BGRA buffer into a base64 PNG.
pub(crate) fn encode_bgra(width: u32, height: u32, mut bgra: Vec<u8>) -> Option<String> {
    if bgra.len() != (width as usize) * (height as usize) * 4 {
        return None;
    }
    ensure_alpha(&mut bgra);
    bgra_to_rgba(&mut bgra);
    let png = encode_png(width, height, bgra)?;
    Some(base64::engine::general_purpose::STANDARD.encode(png))
}

// many legacy icons carry an all-zero alpha channel
fn ensure_alpha(pixels: &mut [u8]) {
    if pixels.chunks_exact(4).all(|pixel| pixel[3] == 0) {
        for pixel in pixels.chunks_exact_mut(4) {
            pixel[3] = 255;
        }
    }
}

fn bgra_to_rgba(pixels: &mut [u8]) {
    for pixel in pixels.chunks_exact_mut(4) {
        pixel.swap(0, 2);
    }
}

fn encode_png(width: u32, height: u32, rgba: Vec<u8>) -> Option<Vec<u8>> {
    let image = image::RgbaImage::from_raw(width, height, rgba)?;
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .ok()?;
    Some(bytes)
}

#[cfg(windows)]
mod windows_impl {
    use super::MAX_DIMENSION;

    use std::ffi::c_void;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;

    use windows::Win32::Graphics::Gdi::{
        BI_RGB, BITMAP, BITMAPINFO, BITMAPINFOHEADER, DIB_RGB_COLORS, DeleteObject, GetDC,
        GetDIBits, GetObjectW, HBITMAP, HDC, ReleaseDC,
    };
    use windows::Win32::UI::Shell::ExtractIconExW;
    use windows::Win32::UI::WindowsAndMessaging::{DestroyIcon, GetIconInfo, HICON, ICONINFO};
    use windows::core::PCWSTR;

    // every GDI handle is released through a guard on every exit path
    struct IconGuard(HICON);

    impl Drop for IconGuard {
        fn drop(&mut self) {
            if !self.0.is_invalid() {
                unsafe {
                    let _ = DestroyIcon(self.0);
                }
            }
        }
    }

    struct BitmapGuard(HBITMAP);

    impl Drop for BitmapGuard {
        fn drop(&mut self) {
            if !self.0.is_invalid() {
                unsafe {
                    let _ = DeleteObject(self.0.into());
                }
            }
        }
    }

    struct DcGuard(HDC);

    impl Drop for DcGuard {
        fn drop(&mut self) {
            unsafe {
                ReleaseDC(None, self.0);
            }
        }
    }

    pub fn extract(path: &Path) -> Option<String> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(std::iter::once(0)).collect();

        let mut large = HICON::default();
        let mut small = HICON::default();
        let extracted =
            unsafe { ExtractIconExW(PCWSTR(wide.as_ptr()), 0, Some(&mut large), Some(&mut small), 1) };
        let _large_guard = IconGuard(large);
        let _small_guard = IconGuard(small);
        if extracted == 0 {
            return None;
        }

        let icon = if !large.is_invalid() { large } else { small };
        if icon.is_invalid() {
            return None;
        }

        let mut info = ICONINFO::default();
        unsafe { GetIconInfo(icon, &mut info) }.ok()?;
        let _mask_guard = BitmapGuard(info.hbmMask);
        let color_guard = BitmapGuard(info.hbmColor);
        if color_guard.0.is_invalid() {
            return None;
        }

        let mut bitmap = BITMAP::default();
        let written = unsafe {
            GetObjectW(
                color_guard.0.into(),
                std::mem::size_of::<BITMAP>() as i32,
                Some(&mut bitmap as *mut _ as *mut c_void),
            )
        };
        if written == 0 {
            return None;
        }

        let (width, height) = (bitmap.bmWidth, bitmap.bmHeight);
        if width <= 0 || height <= 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return None;
        }

        let mut header = BITMAPINFO {
            bmiHeader: BITMAPINFOHEADER {
                biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
                biWidth: width,
                // negative height requests a top-down DIB
                biHeight: -height,
                biPlanes: 1,
                biBitCount: 32,
                biCompression: BI_RGB.0,
                ..BITMAPINFOHEADER::default()
            },
            ..BITMAPINFO::default()
        };

        let mut pixels = vec![0u8; (width as usize) * (height as usize) * 4];
        let dc = DcGuard(unsafe { GetDC(None) });
        let lines = unsafe {
            GetDIBits(
                dc.0,
                color_guard.0,
                0,
                height as u32,
                Some(pixels.as_mut_ptr() as *mut c_void),
                &mut header,
                DIB_RGB_COLORS,
            )
        };
        if lines == 0 {
            return None;
        }

        super::encode_bgra(width as u32, height as u32, pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn zeroed_alpha_is_replaced_before_encoding() {
        let mut pixels = vec![10, 20, 30, 0, 40, 50, 60, 0];
        ensure_alpha(&mut pixels);
        assert_eq!(pixels[3], 255);
        assert_eq!(pixels[7], 255);

        // a single opaque pixel keeps the channel untouched
        let mut pixels = vec![10, 20, 30, 0, 40, 50, 60, 9];
        ensure_alpha(&mut pixels);
        assert_eq!(pixels[3], 0);
        assert_eq!(pixels[7], 9);
    }

    #[test]
    fn bgra_swaps_to_rgba_in_place() {
        let mut pixels = vec![1, 2, 3, 4, 5, 6, 7, 8];
        bgra_to_rgba(&mut pixels);
        assert_eq!(pixels, vec![3, 2, 1, 4, 7, 6, 5, 8]);
    }

    #[test]
    fn encoded_icon_is_a_decodable_png() -> anyhow::Result<()> {
        // 2x2 solid blue BGRA square
        let bgra = vec![
            255, 0, 0, 255, 255, 0, 0, 255, //
            255, 0, 0, 255, 255, 0, 0, 255,
        ];
        let encoded = encode_bgra(2, 2, bgra).expect("encoded icon");

        let png = base64::engine::general_purpose::STANDARD.decode(encoded)?;
        let image = image::load_from_memory(&png)?.to_rgba8();
        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 255, 255]);
        Ok(())
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        assert!(encode_bgra(4, 4, vec![0; 8]).is_none());
    }
}
