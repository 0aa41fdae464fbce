//! Pure rectangle/rotation math shared by the move-rect and dirty-rect
//! compositor stages. Kept free of any GPU handle so it can be unit tested
//! without a device.

/// A monitor's reported rotation, mirroring `DXGI_MODE_ROTATION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rotation {
    Identity,
    Unspecified,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    /// Monitors reported as rotated are not eligible recovery targets:
    /// only identity/unspecified outputs may be matched back up
    /// during re-enumeration.
    pub fn is_recovery_eligible(self) -> bool {
        matches!(self, Rotation::Identity | Rotation::Unspecified)
    }
}

/// An axis-aligned rectangle in `left/top/right/bottom` form, matching
/// Win32's `RECT` layout and the rest of this pipeline's coordinate
/// convention (origin top-left, y grows downward).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    pub fn offset(&self, dx: i32, dy: i32) -> Rect {
        Rect {
            left: self.left + dx,
            top: self.top + dy,
            right: self.right + dx,
            bottom: self.bottom + dy,
        }
    }
}

/// One DXGI move-rect notification: the rectangle at `source_point` of the
/// previous composite now lives at `dest_rect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRect {
    pub source_point: (i32, i32),
    pub dest_rect: Rect,
}

/// The source and destination rectangles (both already offset into
/// shared-surface coordinates) that a move-rect replay copies between, after
/// accounting for this monitor's rotation.
///
/// `desktop_size` is the duplication output's *unrotated* pixel dimensions
/// (width, height) as reported by the duplicator; rotation swaps which axis
/// this uses to fold the source point back into a rectangle.
pub fn rotate_move_rect(
    mv: &MoveRect,
    rotation: Rotation,
    desktop_size: (i32, i32),
) -> (Rect, Rect) {
    let (desktop_w, desktop_h) = desktop_size;
    let dest = mv.dest_rect;
    let w = dest.width();
    let h = dest.height();
    let (sx, sy) = mv.source_point;

    let src = match rotation {
        Rotation::Identity | Rotation::Unspecified => Rect::new(sx, sy, sx + w, sy + h),
        Rotation::Rotate90 => Rect::new(
            desktop_h - (sy + h),
            sx,
            desktop_h - sy,
            sx + w,
        ),
        Rotation::Rotate180 => Rect::new(
            desktop_w - (sx + w),
            desktop_h - (sy + h),
            desktop_w - sx,
            desktop_h - sy,
        ),
        Rotation::Rotate270 => Rect::new(
            sy,
            desktop_w - (sx + w),
            sy + h,
            desktop_w - sx,
        ),
    };

    let dst = match rotation {
        Rotation::Identity | Rotation::Unspecified => dest,
        Rotation::Rotate90 => Rect::new(
            desktop_h - dest.bottom,
            dest.left,
            desktop_h - dest.top,
            dest.right,
        ),
        Rotation::Rotate180 => Rect::new(
            desktop_w - dest.right,
            desktop_h - dest.bottom,
            desktop_w - dest.left,
            desktop_h - dest.top,
        ),
        Rotation::Rotate270 => Rect::new(
            dest.top,
            desktop_w - dest.right,
            dest.bottom,
            desktop_w - dest.left,
        ),
    };

    (src, dst)
}

/// One vertex of the dirty-rect triangle list: NDC position plus the
/// desktop-texture UV it samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub position: [f32; 3],
    pub texcoord: [f32; 2],
}

/// The four UV corners of a rect in desktop-texture space, as fractions of
/// the desktop texture's width/height.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvCorners {
    pub top_left: [f32; 2],
    pub top_right: [f32; 2],
    pub bottom_left: [f32; 2],
    pub bottom_right: [f32; 2],
}

fn uv_corners(rect: Rect, desktop_size: (i32, i32)) -> UvCorners {
    let (w, h) = (desktop_size.0 as f32, desktop_size.1 as f32);
    let u0 = rect.left as f32 / w;
    let u1 = rect.right as f32 / w;
    let v0 = rect.top as f32 / h;
    let v1 = rect.bottom as f32 / h;
    UvCorners {
        top_left: [u0, v0],
        top_right: [u1, v0],
        bottom_left: [u0, v1],
        bottom_right: [u1, v1],
    }
}

/// Build the six vertices (two triangles) for one dirty rect using its
/// UV-corner table. `dirty` is in monitor-local
/// coordinates; `monitor_offset` and `virtual_desktop_origin` translate it
/// into shared-surface space; `center`/`surface_origin` turn that into NDC.
pub fn dirty_rect_vertices(
    dirty: Rect,
    rotation: Rotation,
    desktop_size: (i32, i32),
    monitor_offset: (i32, i32),
    virtual_desktop_origin: (i32, i32),
    surface_center: (f32, f32),
) -> [Vertex; 6] {
    let uv = uv_corners(dirty, desktop_size);

    // Six vertices, two triangles, CCW: (BL, TL, BR) and (TL, TR, BR) is one
    // common winding; naming the corners v0,v1,v2,v5 to match the table this
    // layout reproduces directly (v2 and v3 coincide with BR, v4 with TL).
    let (v0, v1, v2, v5) = match rotation {
        Rotation::Identity | Rotation::Unspecified => {
            (uv.bottom_left, uv.top_left, uv.bottom_right, uv.top_right)
        }
        Rotation::Rotate90 => (uv.bottom_right, uv.bottom_left, uv.top_right, uv.top_left),
        Rotation::Rotate180 => (uv.top_right, uv.bottom_right, uv.top_left, uv.bottom_left),
        Rotation::Rotate270 => (uv.top_left, uv.top_right, uv.bottom_left, uv.bottom_right),
    };
    let v3 = v2;
    let v4 = v1;

    let translated = Rect::new(
        dirty.left + monitor_offset.0 - virtual_desktop_origin.0,
        dirty.top + monitor_offset.1 - virtual_desktop_origin.1,
        dirty.right + monitor_offset.0 - virtual_desktop_origin.0,
        dirty.bottom + monitor_offset.1 - virtual_desktop_origin.1,
    );

    let (cx, cy) = surface_center;
    let ndc_x = |x: i32| (x as f32 - cx) / cx;
    let ndc_y = |y: i32| -((y as f32 - cy) / cy);

    let bl = [ndc_x(translated.left), ndc_y(translated.bottom), 0.0];
    let tl = [ndc_x(translated.left), ndc_y(translated.top), 0.0];
    let br = [ndc_x(translated.right), ndc_y(translated.bottom), 0.0];
    let tr = [ndc_x(translated.right), ndc_y(translated.top), 0.0];

    [
        Vertex { position: bl, texcoord: v0 },
        Vertex { position: tl, texcoord: v1 },
        Vertex { position: br, texcoord: v2 },
        Vertex { position: br, texcoord: v3 },
        Vertex { position: tl, texcoord: v4 },
        Vertex { position: tr, texcoord: v5 },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_rect_identity_is_unchanged() {
        let mv = MoveRect { source_point: (10, 20), dest_rect: Rect::new(30, 40, 50, 70) };
        let (src, dst) = rotate_move_rect(&mv, Rotation::Identity, (1920, 1080));
        assert_eq!(src, Rect::new(10, 20, 30, 50));
        assert_eq!(dst, mv.dest_rect);
    }

    #[test]
    fn dirty_rect_edge_uvs_are_exact() {
        let dirty = Rect::new(0, 0, 1920, 1080);
        let verts = dirty_rect_vertices(
            dirty,
            Rotation::Identity,
            (1920, 1080),
            (0, 0),
            (0, 0),
            (960.0, 540.0),
        );
        for v in &verts {
            assert!(v.texcoord[0] == 0.0 || v.texcoord[0] == 1.0);
            assert!(v.texcoord[1] == 0.0 || v.texcoord[1] == 1.0);
        }
    }

    #[test]
    fn dirty_rect_rotation_table_matches_spec() {
        let dirty = Rect::new(0, 0, 100, 50);
        let desktop = (200, 100);
        let center = (100.0, 50.0);

        let identity = dirty_rect_vertices(dirty, Rotation::Identity, desktop, (0, 0), (0, 0), center);
        assert_eq!(identity[0].texcoord, [0.0, 0.5]); // BL
        assert_eq!(identity[1].texcoord, [0.0, 0.0]); // TL
        assert_eq!(identity[2].texcoord, [0.5, 0.5]); // BR
        assert_eq!(identity[5].texcoord, [0.5, 0.0]); // TR

        let r90 = dirty_rect_vertices(dirty, Rotation::Rotate90, desktop, (0, 0), (0, 0), center);
        assert_eq!(r90[0].texcoord, [0.5, 0.5]); // BR
        assert_eq!(r90[1].texcoord, [0.0, 0.5]); // BL
        assert_eq!(r90[2].texcoord, [0.5, 0.0]); // TR
        assert_eq!(r90[5].texcoord, [0.0, 0.0]); // TL
    }

    #[test]
    fn rect_union_covers_both() {
        let a = Rect::new(0, 0, 1920, 1080);
        let b = Rect::new(1920, 0, 3840, 1080);
        assert_eq!(a.union(&b), Rect::new(0, 0, 3840, 1080));
    }
}
