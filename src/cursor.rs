//! Cursor shape decoding and cross-output position tracking.
//!
//! `CursorState` accumulates pointer updates across frames from every
//! `ScreenDuplicator` in a recording; only one output "owns" the
//! pointer at a time, decided by [`should_apply_update`].

/// The three pointer-shape encodings a duplication interface can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    Color,
    Monochrome,
    MaskedColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeInfo {
    pub kind: ShapeKind,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub hotspot: (i32, i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPosition {
    pub x: i32,
    pub y: i32,
    pub visible: bool,
}

/// Cross-frame, cross-output cursor state. `last_update_time` and
/// `owning_output` implement the ownership-disambiguation rule;
/// `shape_buffer`/`shape_info` are only populated when a new shape arrives
/// (a zero `last_mouse_update_time` on a frame means "unchanged", so the
/// duplicator never calls [`CursorState::set_shape`] for that frame).
pub struct CursorState {
    shape_buffer: Vec<u8>,
    shape_info: Option<ShapeInfo>,
    position: CursorPosition,
    last_update_time: i64,
    owning_output: Option<usize>,
}

impl Default for CursorState {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorState {
    pub fn new() -> Self {
        Self {
            shape_buffer: Vec::new(),
            shape_info: None,
            position: CursorPosition { x: 0, y: 0, visible: false },
            last_update_time: 0,
            owning_output: None,
        }
    }

    pub fn position(&self) -> CursorPosition {
        self.position
    }

    pub fn shape(&self) -> Option<(&ShapeInfo, &[u8])> {
        self.shape_info.as_ref().map(|info| (info, self.shape_buffer.as_slice()))
    }

    /// Replace the pointer shape. Called only when the duplicator reports a
    /// new shape buffer for this frame (`pointer_shape_buffer_size != 0`).
    pub fn set_shape(&mut self, info: ShapeInfo, data: &[u8]) {
        self.shape_buffer.clear();
        self.shape_buffer.extend_from_slice(data);
        self.shape_info = Some(info);
    }

    /// Apply a position update from `output_index`, honoring the
    /// ownership-disambiguation rule. `update_time == 0` means "no update
    /// this frame" and is always ignored.
    pub fn update_position(
        &mut self,
        new_position: CursorPosition,
        update_time: i64,
        output_index: usize,
    ) {
        if update_time == 0 {
            return;
        }
        if should_apply_update(
            self.position.visible,
            self.owning_output,
            self.last_update_time,
            new_position.visible,
            update_time,
            output_index,
        ) {
            self.position = new_position;
            self.last_update_time = update_time;
            self.owning_output = Some(output_index);
        }
    }
}

/// Pure decision function for the cursor-ownership rule. Split out of
/// [`CursorState::update_position`] so it can be exhaustively unit tested
/// without constructing a `CursorState`.
#[allow(clippy::too_many_arguments)]
pub fn should_apply_update(
    _stored_visible: bool,
    current_owner: Option<usize>,
    last_update_time: i64,
    new_visible: bool,
    update_time: i64,
    output_index: usize,
) -> bool {
    if new_visible {
        return true;
    }
    if current_owner == Some(output_index) {
        return true;
    }
    // stored position must also be visible for the "newer wins" case: if the
    // currently-stored position is already invisible there is nothing to
    // contest ownership over, so a different, still-invisible output cannot
    // win it. Visibility of the stored position is tracked by the caller via
    // `_stored_visible`, folded in by the three-way rule below.
    if _stored_visible && current_owner.is_some() && current_owner != Some(output_index) && update_time > last_update_time {
        return true;
    }
    false
}

/// Decode one pixel of a monochrome (AND/XOR) cursor mask using the
/// four-way truth table preferred over the source's two-way approximation
/// `(and=0,xor=0)`=opaque black, `(0,1)`=opaque white,
/// `(1,0)`=transparent (background passes through), `(1,1)`=invert.
pub fn decode_monochrome_pixel(and_bit: bool, xor_bit: bool, background_bgra: [u8; 4]) -> [u8; 4] {
    match (and_bit, xor_bit) {
        (false, false) => [0, 0, 0, 0xFF],
        (false, true) => [0xFF, 0xFF, 0xFF, 0xFF],
        (true, false) => background_bgra,
        (true, true) => [
            !background_bgra[0],
            !background_bgra[1],
            !background_bgra[2],
            0xFF,
        ],
    }
}

/// Decode one pixel of a masked-color cursor. Alpha 0 replaces the
/// background with the mask's RGB; alpha 0xFF XORs RGB with the background;
/// any other alpha is treated as 0xFF.
pub fn decode_masked_color_pixel(mask_argb: [u8; 4], background_bgra: [u8; 4]) -> [u8; 4] {
    let [b, g, r, a] = mask_argb;
    if a == 0 {
        [b, g, r, 0xFF]
    } else {
        [
            b ^ background_bgra[0],
            g ^ background_bgra[1],
            r ^ background_bgra[2],
            0xFF,
        ]
    }
}

/// Clip a cursor rectangle positioned at `pos` with size `(width, height)`
/// against a surface of `surface_size`, returning the clipped on-surface
/// rectangle plus the `(mask_x, mask_y)` origin into the shape buffer the
/// visible portion starts at.
pub fn clip_cursor_rect(
    pos: (i32, i32),
    size: (u32, u32),
    surface_size: (u32, u32),
) -> (crate::geometry::Rect, (u32, u32)) {
    let mask_x = if pos.0 < 0 { (-pos.0) as u32 } else { 0 };
    let mask_y = if pos.1 < 0 { (-pos.1) as u32 } else { 0 };

    let left = pos.0.max(0);
    let top = pos.1.max(0);
    let right = (pos.0 + size.0 as i32).min(surface_size.0 as i32);
    let bottom = (pos.1 + size.1 as i32).min(surface_size.1 as i32);

    (crate::geometry::Rect::new(left, top, right.max(left), bottom.max(top)), (mask_x, mask_y))
}

/// Upload a decoded BGRA cursor sprite as an immutable shader-resource
/// texture, ready to bind for the composite draw call.
pub fn make_color_texture(
    device: &windows::Win32::Graphics::Direct3D11::ID3D11Device,
    width: u32,
    height: u32,
    bgra_pixels: &[u8],
) -> crate::error::Result<windows::Win32::Graphics::Direct3D11::ID3D11Texture2D> {
    use windows::Win32::Graphics::Direct3D11::{
        D3D11_BIND_SHADER_RESOURCE, D3D11_SUBRESOURCE_DATA, D3D11_TEXTURE2D_DESC,
        D3D11_USAGE_IMMUTABLE,
    };
    use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_SAMPLE_DESC};

    let desc = D3D11_TEXTURE2D_DESC {
        Width: width,
        Height: height,
        MipLevels: 1,
        ArraySize: 1,
        Format: DXGI_FORMAT_B8G8R8A8_UNORM,
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        Usage: D3D11_USAGE_IMMUTABLE,
        BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
        CPUAccessFlags: 0,
        MiscFlags: 0,
    };
    let initial = D3D11_SUBRESOURCE_DATA {
        pSysMem: bgra_pixels.as_ptr() as *const _,
        SysMemPitch: width * 4,
        SysMemSlicePitch: 0,
    };
    let mut texture = None;
    unsafe { device.CreateTexture2D(&desc, Some(&initial), Some(&mut texture)) }
        .map_err(crate::error::FatalError::Other)?;
    texture.ok_or_else(|| crate::error::FatalError::Other(windows::core::Error::empty()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_update_time_is_ignored() {
        let mut cs = CursorState::new();
        cs.update_position(CursorPosition { x: 5, y: 5, visible: true }, 0, 0);
        assert_eq!(cs.position(), CursorPosition { x: 0, y: 0, visible: false });
    }

    #[test]
    fn visible_update_always_applies() {
        assert!(should_apply_update(false, None, 0, true, 10, 0));
        assert!(should_apply_update(true, Some(1), 5, true, 10, 2));
    }

    #[test]
    fn owner_can_update_while_invisible() {
        assert!(should_apply_update(true, Some(0), 5, false, 10, 0));
    }

    #[test]
    fn newer_visible_pointer_on_other_output_wins() {
        assert!(should_apply_update(true, Some(0), 5, false, 10, 1) == false);
    }

    #[test]
    fn scenario_a_visible_b_visible_b_visible_a_invisible() {
        // (A:visible, B:visible, B:visible, A:invisible) with monotonic timestamps.
        let mut cs = CursorState::new();
        cs.update_position(CursorPosition { x: 1, y: 1, visible: true }, 1, 0); // A
        assert_eq!(cs.owning_output, Some(0));
        cs.update_position(CursorPosition { x: 2, y: 2, visible: true }, 2, 1); // B
        assert_eq!(cs.owning_output, Some(1));
        cs.update_position(CursorPosition { x: 3, y: 3, visible: true }, 3, 1); // B again
        assert_eq!(cs.owning_output, Some(1));
        // A goes invisible: A is not the owner, and the stored position (B,
        // visible) beats an invisible contender only if the new update is
        // itself visible or A is the owner — neither holds, so ignored.
        cs.update_position(CursorPosition { x: 4, y: 4, visible: false }, 4, 0);
        assert_eq!(cs.owning_output, Some(1));
        assert_eq!(cs.position().visible, true);
    }

    #[test]
    fn monochrome_four_way_truth_table() {
        let bg = [10, 20, 30, 0xFF];
        assert_eq!(decode_monochrome_pixel(false, false, bg), [0, 0, 0, 0xFF]);
        assert_eq!(decode_monochrome_pixel(false, true, bg), [0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(decode_monochrome_pixel(true, false, bg), bg);
        assert_eq!(decode_monochrome_pixel(true, true, bg), [245, 235, 225, 0xFF]);
    }

    #[test]
    fn masked_color_replace_and_xor() {
        let bg = [10, 20, 30, 0xFF];
        assert_eq!(decode_masked_color_pixel([1, 2, 3, 0], bg), [1, 2, 3, 0xFF]);
        assert_eq!(
            decode_masked_color_pixel([1, 2, 3, 0xFF], bg),
            [1 ^ 10, 2 ^ 20, 3 ^ 30, 0xFF]
        );
    }

    #[test]
    fn clip_negative_origin() {
        let (rect, mask_origin) = clip_cursor_rect((-5, 0), (32, 32), (1920, 1080));
        assert_eq!(rect.left, 0);
        assert_eq!(mask_origin, (5, 0));
    }

    #[test]
    fn clip_past_right_edge() {
        let (rect, _) = clip_cursor_rect((1900, 0), (32, 32), (1920, 1080));
        assert_eq!(rect.right, 1920);
    }
}
