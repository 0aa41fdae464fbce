//! The per-tick compositor: acquire, replay moves, replay dirties, compose
//! cursor, wrap as a sample.

use log::{trace, warn};
use windows::core::Interface;
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Device, ID3D11DeviceContext, ID3D11RenderTargetView, ID3D11ShaderResourceView,
    ID3D11Texture2D, D3D11_BOX, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT, D3D11_VIEWPORT,
};
use windows::Win32::Graphics::Direct3D::D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST;

use crate::cursor::{self, CursorState, ShapeKind};
use crate::duplication::{AcquireOutcome, Frame, ScreenDuplicator};
use crate::error::Result;
use crate::geometry::{self, Rect, Vertex};
use crate::shader::ShaderCache;
use crate::texture_pool::TexturePool;
use crate::virtual_desktop::VirtualDesktop;

/// A composited frame handed off to the SinkWriter. Dropping it without
/// calling [`CompositedSample::detach`] returns the texture to the pool —
/// the right outcome for a sample that never reaches the encoder (e.g.
/// pipeline torn down mid-flight). Once the texture has actually been
/// wrapped into a sample and handed to the encoder, the encoder's own
/// asynchronous release callback becomes the sole owner of the pool-return;
/// the caller must `detach()` first so neither `release()` nor `Drop` also
/// returns it.
pub struct CompositedSample {
    texture: Option<ID3D11Texture2D>,
    pool: TexturePool,
}

impl CompositedSample {
    pub fn texture(&self) -> &ID3D11Texture2D {
        self.texture.as_ref().expect("texture already released")
    }

    pub fn release(mut self) {
        if let Some(texture) = self.texture.take() {
            self.pool.release(texture);
        }
    }

    /// Give up ownership of the texture without returning it to the pool.
    /// Call this once the texture has been wrapped into a sample that the
    /// encoder's release callback now owns — the only remaining reference
    /// this struct holds must not also push it onto the free-list.
    pub fn detach(mut self) {
        let _ = self.texture.take();
    }
}

impl Drop for CompositedSample {
    fn drop(&mut self) {
        if let Some(texture) = self.texture.take() {
            self.pool.release(texture);
        }
    }
}

/// Owns one ScreenDuplicator, one TexturePool, one ShaderCache, and the
/// staging/vertex-buffer state reused across ticks. The tick sequence is a
/// fixed method chain rather than a dispatch table: there is exactly one
/// way to composite a frame, so nothing is gained by making the steps
/// pluggable.
pub struct Pipeline {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    duplicator: ScreenDuplicator,
    virtual_desktop_bounds: Rect,
    shader_cache: ShaderCache,
    texture_pool: Option<TexturePool>,
    staging_texture: Option<ID3D11Texture2D>,
    render_target_view: Option<ID3D11RenderTargetView>,
    render_target_view_source: usize,
    vertex_buffer: Option<windows::Win32::Graphics::Direct3D11::ID3D11Buffer>,
    /// Cleared at the top of every tick: this mirrors the "drop whatever
    /// sample was pending before starting a new one" rule any per-tick
    /// compositor needs once a sample can outlive the tick that built it.
    pending_sample: Option<CompositedSample>,
}

impl Pipeline {
    pub fn new(
        device: ID3D11Device,
        duplicator: ScreenDuplicator,
        virtual_desktop_bounds: Rect,
    ) -> Result<Self> {
        let context = unsafe { device.GetImmediateContext() }.map_err(crate::error::FatalError::Other)?;
        let shader_cache = ShaderCache::new(&device)?;
        Ok(Self {
            device,
            context,
            duplicator,
            virtual_desktop_bounds,
            shader_cache,
            texture_pool: None,
            staging_texture: None,
            render_target_view: None,
            render_target_view_source: 0,
            vertex_buffer: None,
            pending_sample: None,
        })
    }

    /// Drop cached GPU views tied to the virtual desktop's shared surface.
    /// Must be called whenever that surface is recreated (a topology change
    /// recreates it with a new backing resource; the old render-target view
    /// would otherwise silently keep targeting a freed texture).
    pub fn invalidate_surface_views(&mut self) {
        self.render_target_view = None;
        self.render_target_view_source = 0;
        self.staging_texture = None;
        self.texture_pool = None;
    }

    /// A clone of the pool backing this pipeline's composited samples, if a
    /// tick has run at least once since construction or the last
    /// [`Pipeline::invalidate_surface_views`]. Used by the caller to wrap a
    /// [`CompositedSample`]'s texture as an encoder sample with a release
    /// path back to this same pool.
    pub fn texture_pool_handle(&self) -> Option<TexturePool> {
        self.texture_pool.clone()
    }

    /// Run one compositor tick. Returns `None` on SkipTick (no sample
    /// produced); otherwise the composited sample to hand to the SinkWriter.
    pub fn tick(
        &mut self,
        virtual_desktop: &mut VirtualDesktop,
        cursor: &mut CursorState,
    ) -> Result<Option<CompositedSample>> {
        // Clear prior sample on entry: a sample from an earlier tick must
        // never leak forward into this one.
        self.pending_sample = None;

        let frame = match self.duplicator.acquire_frame(cursor)?  {
            AcquireOutcome::SkipTick => return Ok(None),
            AcquireOutcome::Frame(f) => f,
        };

        if !frame.captured {
            return Ok(None);
        }

        let shared_texture = virtual_desktop.surface().texture().clone();
        {
            let lock = virtual_desktop.lock()?;
            if !lock.locked() {
                trace!("shared surface lock timed out, skipping tick");
                return Ok(None);
            }
            self.ensure_pool_and_staging(&frame)?;
            self.replay_move_rects(&shared_texture, &frame)?;
            self.replay_dirty_rects(&shared_texture, &frame)?;
            // lock drops here, releasing before the cursor composite step.
        }

        let composited = self.compose_cursor(virtual_desktop, cursor)?;
        Ok(Some(composited))
    }

    fn ensure_pool_and_staging(&mut self, frame: &Frame) -> Result<()> {
        if self.staging_texture.is_some() {
            return Ok(());
        }
        let texture = frame
            .desktop_texture
            .as_ref()
            .expect("captured frame always carries a desktop texture");
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        desc.BindFlags = windows::Win32::Graphics::Direct3D11::D3D11_BIND_RENDER_TARGET.0 as u32;
        desc.MiscFlags = 0;
        desc.Usage = D3D11_USAGE_DEFAULT;

        let mut staging: Option<ID3D11Texture2D> = None;
        unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut staging)) }
            .map_err(crate::error::FatalError::Other)?;
        self.staging_texture = staging;

        self.texture_pool = Some(TexturePool::for_frame(self.device.clone(), &desc));
        Ok(())
    }

    fn replay_move_rects(&mut self, shared_texture: &ID3D11Texture2D, frame: &Frame) -> Result<()> {
        if frame.move_rects.is_empty() {
            return Ok(());
        }
        let staging = self.staging_texture.as_ref().expect("staging texture allocated before move-rect replay");
        let desktop_size = (frame.monitor_bounds.width(), frame.monitor_bounds.height());
        let monitor_offset = (frame.monitor_bounds.left, frame.monitor_bounds.top);
        let vd_origin = (self.virtual_desktop_bounds.left, self.virtual_desktop_bounds.top);

        for mv in &frame.move_rects {
            let (src, dst) = geometry::rotate_move_rect(mv, frame.rotation, desktop_size);
            let src_shared = src.offset(monitor_offset.0 - vd_origin.0, monitor_offset.1 - vd_origin.1);
            let dst_shared = dst.offset(monitor_offset.0 - vd_origin.0, monitor_offset.1 - vd_origin.1);

            let src_box = rect_to_box(src_shared);
            unsafe {
                self.context.CopySubresourceRegion(
                    staging,
                    0,
                    0,
                    0,
                    0,
                    shared_texture,
                    0,
                    Some(&src_box),
                );
            }
            let copy_back_box = rect_to_box(Rect::new(0, 0, src_shared.width(), src_shared.height()));
            unsafe {
                self.context.CopySubresourceRegion(
                    shared_texture,
                    0,
                    dst_shared.left as u32,
                    dst_shared.top as u32,
                    0,
                    staging,
                    0,
                    Some(&copy_back_box),
                );
            }
        }
        Ok(())
    }

    fn replay_dirty_rects(&mut self, shared_texture: &ID3D11Texture2D, frame: &Frame) -> Result<()> {
        if frame.dirty_rects.is_empty() {
            return Ok(());
        }
        let desktop_texture = frame
            .desktop_texture
            .as_ref()
            .expect("captured frame always carries a desktop texture");

        let srv = create_srv(&self.device, desktop_texture)?;
        let rtv = self.render_target_view(shared_texture)?;

        let mut surface_desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { shared_texture.GetDesc(&mut surface_desc) };
        let center = (surface_desc.Width as f32 / 2.0, surface_desc.Height as f32 / 2.0);
        let desktop_size = (frame.monitor_bounds.width(), frame.monitor_bounds.height());
        let monitor_offset = (frame.monitor_bounds.left, frame.monitor_bounds.top);
        let vd_origin = (self.virtual_desktop_bounds.left, self.virtual_desktop_bounds.top);

        let mut vertices: Vec<Vertex> = Vec::with_capacity(frame.dirty_rects.len() * 6);
        for dirty in &frame.dirty_rects {
            vertices.extend_from_slice(&geometry::dirty_rect_vertices(
                *dirty,
                frame.rotation,
                desktop_size,
                monitor_offset,
                vd_origin,
                center,
            ));
        }

        let vertex_buffer = create_vertex_buffer(&self.device, &vertices)?;

        unsafe {
            self.context.OMSetRenderTargets(Some(&[Some(rtv.clone())]), None);
            self.context.OMSetBlendState(None, None, 0xFFFFFFFF);
            self.context.IASetInputLayout(self.shader_cache.input_layout());
            self.context.IASetPrimitiveTopology(D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            let stride = std::mem::size_of::<Vertex>() as u32;
            let offset = 0u32;
            self.context.IASetVertexBuffers(0, 1, Some(&Some(vertex_buffer.clone())), Some(&stride), Some(&offset));
            self.context.VSSetShader(self.shader_cache.vertex_shader(), None);
            self.context.PSSetShader(self.shader_cache.pixel_shader(), None);
            self.context.PSSetShaderResources(0, Some(&[Some(srv)]));
            self.context.PSSetSamplers(0, Some(&[Some(self.shader_cache.linear_sampler().clone())]));
            self.context.RSSetViewports(Some(&[D3D11_VIEWPORT {
                TopLeftX: 0.0,
                TopLeftY: 0.0,
                Width: surface_desc.Width as f32,
                Height: surface_desc.Height as f32,
                MinDepth: 0.0,
                MaxDepth: 1.0,
            }]));
            self.context.Draw(vertices.len() as u32, 0);
        }
        self.vertex_buffer = Some(vertex_buffer);
        Ok(())
    }

    fn render_target_view(&mut self, shared_texture: &ID3D11Texture2D) -> Result<ID3D11RenderTargetView> {
        let source = shared_texture.as_raw() as usize;
        if source != self.render_target_view_source {
            self.render_target_view = None;
        }
        if let Some(rtv) = &self.render_target_view {
            return Ok(rtv.clone());
        }
        let mut rtv: Option<ID3D11RenderTargetView> = None;
        unsafe { self.device.CreateRenderTargetView(shared_texture, None, Some(&mut rtv)) }
            .map_err(crate::error::FatalError::Other)?;
        let rtv = rtv.ok_or(crate::error::FatalError::Other(windows::core::Error::empty()))?;
        self.render_target_view = Some(rtv.clone());
        self.render_target_view_source = source;
        Ok(rtv)
    }

    /// Step E: acquire a pooled texture, copy the shared surface into it,
    /// draw the cursor sprite if visible. Needs no shared-surface lock — it
    /// only reads via one point-in-time full-resource copy.
    fn compose_cursor(&mut self, vd: &mut VirtualDesktop, cursor: &CursorState) -> Result<CompositedSample> {
        let pool = self
            .texture_pool
            .clone()
            .expect("pool allocated during ensure_pool_and_staging");
        let output_texture = pool.acquire();

        unsafe {
            self.context.CopyResource(&output_texture, vd.surface().texture());
        }

        let position = cursor.position();
        if position.visible {
            if let Some((shape_info, shape_data)) = cursor.shape() {
                if let Err(e) = self.draw_cursor_sprite(&output_texture, position, shape_info, shape_data) {
                    warn!("cursor composite failed, emitting frame without cursor: {e:?}");
                }
            }
        }

        Ok(CompositedSample { texture: Some(output_texture), pool })
    }

    fn draw_cursor_sprite(
        &mut self,
        output_texture: &ID3D11Texture2D,
        position: crate::cursor::CursorPosition,
        shape_info: &crate::cursor::ShapeInfo,
        shape_data: &[u8],
    ) -> Result<()> {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { output_texture.GetDesc(&mut desc) };

        let effective_height = match shape_info.kind {
            ShapeKind::Monochrome => shape_info.height / 2,
            _ => shape_info.height,
        };
        let (clip_rect, mask_origin) = cursor::clip_cursor_rect(
            (position.x, position.y),
            (shape_info.width, effective_height),
            (desc.Width, desc.Height),
        );
        if clip_rect.width() <= 0 || clip_rect.height() <= 0 {
            return Ok(());
        }

        let sprite_texture = self.build_cursor_texture(
            output_texture,
            shape_info,
            shape_data,
            clip_rect,
            mask_origin,
            effective_height,
        )?;

        let srv = create_srv(&self.device, &sprite_texture)?;
        let rtv = {
            let mut rtv: Option<ID3D11RenderTargetView> = None;
            unsafe { self.device.CreateRenderTargetView(output_texture, None, Some(&mut rtv)) }
                .map_err(crate::error::FatalError::Other)?;
            rtv.ok_or(crate::error::FatalError::Other(windows::core::Error::empty()))?
        };

        let center = (desc.Width as f32 / 2.0, desc.Height as f32 / 2.0);
        let ndc_x = |x: i32| (x as f32 - center.0) / center.0;
        let ndc_y = |y: i32| -((y as f32 - center.1) / center.1);
        let verts = [
            Vertex { position: [ndc_x(clip_rect.left), ndc_y(clip_rect.bottom), 0.0], texcoord: [0.0, 1.0] },
            Vertex { position: [ndc_x(clip_rect.left), ndc_y(clip_rect.top), 0.0], texcoord: [0.0, 0.0] },
            Vertex { position: [ndc_x(clip_rect.right), ndc_y(clip_rect.bottom), 0.0], texcoord: [1.0, 1.0] },
            Vertex { position: [ndc_x(clip_rect.right), ndc_y(clip_rect.bottom), 0.0], texcoord: [1.0, 1.0] },
            Vertex { position: [ndc_x(clip_rect.left), ndc_y(clip_rect.top), 0.0], texcoord: [0.0, 0.0] },
            Vertex { position: [ndc_x(clip_rect.right), ndc_y(clip_rect.top), 0.0], texcoord: [1.0, 0.0] },
        ];
        let vertex_buffer = create_vertex_buffer(&self.device, &verts)?;

        unsafe {
            self.context.OMSetRenderTargets(Some(&[Some(rtv)]), None);
            self.context.OMSetBlendState(self.shader_cache.blend_state(), None, 0xFFFFFFFF);
            self.context.IASetInputLayout(self.shader_cache.input_layout());
            self.context.IASetPrimitiveTopology(D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            let stride = std::mem::size_of::<Vertex>() as u32;
            let offset = 0u32;
            self.context.IASetVertexBuffers(0, 1, Some(&Some(vertex_buffer)), Some(&stride), Some(&offset));
            self.context.VSSetShader(self.shader_cache.vertex_shader(), None);
            self.context.PSSetShader(self.shader_cache.pixel_shader(), None);
            self.context.PSSetShaderResources(0, Some(&[Some(srv)]));
            self.context.PSSetSamplers(0, Some(&[Some(self.shader_cache.linear_sampler().clone())]));
            self.context.RSSetViewports(Some(&[D3D11_VIEWPORT {
                TopLeftX: 0.0,
                TopLeftY: 0.0,
                Width: desc.Width as f32,
                Height: desc.Height as f32,
                MinDepth: 0.0,
                MaxDepth: 1.0,
            }]));
            self.context.Draw(6, 0);
        }
        Ok(())
    }

    /// Read back the background pixels beneath the cursor, decode the
    /// shape against them (color/monochrome/masked-color),
    /// and upload the result as a BGRA shader-resource texture.
    fn build_cursor_texture(
        &mut self,
        background: &ID3D11Texture2D,
        shape_info: &crate::cursor::ShapeInfo,
        shape_data: &[u8],
        clip_rect: Rect,
        mask_origin: (u32, u32),
        effective_height: u32,
    ) -> Result<ID3D11Texture2D> {
        let width = clip_rect.width() as u32;
        let height = clip_rect.height() as u32;

        let background_pixels = self.read_back_region(background, clip_rect)?;

        let mut pixels = vec![0u8; (width * height * 4) as usize];
        match shape_info.kind {
            ShapeKind::Color => {
                for y in 0..height {
                    let src_row = (mask_origin.1 + y) as usize * shape_info.pitch as usize;
                    let src = &shape_data[src_row + mask_origin.0 as usize * 4..][..(width * 4) as usize];
                    let dst_row = (y * width * 4) as usize;
                    pixels[dst_row..dst_row + (width * 4) as usize].copy_from_slice(src);
                }
            }
            ShapeKind::Monochrome => {
                let mask_pitch = shape_info.pitch as usize;
                let and_base = 0usize;
                let xor_base = mask_pitch * effective_height as usize;
                for y in 0..height {
                    for x in 0..width {
                        let my = (mask_origin.1 + y) as usize;
                        let mx = mask_origin.0 as usize + x as usize;
                        let byte_index = mx / 8;
                        let bit = 7 - (mx % 8);
                        let and_bit = (shape_data[and_base + my * mask_pitch + byte_index] >> bit) & 1 != 0;
                        let xor_bit = (shape_data[xor_base + my * mask_pitch + byte_index] >> bit) & 1 != 0;
                        let bg_idx = ((y * width + x) * 4) as usize;
                        let bg = [
                            background_pixels[bg_idx],
                            background_pixels[bg_idx + 1],
                            background_pixels[bg_idx + 2],
                            background_pixels[bg_idx + 3],
                        ];
                        let out = cursor::decode_monochrome_pixel(and_bit, xor_bit, bg);
                        pixels[bg_idx..bg_idx + 4].copy_from_slice(&out);
                    }
                }
            }
            ShapeKind::MaskedColor => {
                for y in 0..height {
                    for x in 0..width {
                        let my = (mask_origin.1 + y) as usize;
                        let mx = mask_origin.0 as usize + x as usize;
                        let mask_idx = my * shape_info.pitch as usize + mx * 4;
                        let mask = [
                            shape_data[mask_idx],
                            shape_data[mask_idx + 1],
                            shape_data[mask_idx + 2],
                            shape_data[mask_idx + 3],
                        ];
                        let bg_idx = ((y * width + x) * 4) as usize;
                        let bg = [
                            background_pixels[bg_idx],
                            background_pixels[bg_idx + 1],
                            background_pixels[bg_idx + 2],
                            background_pixels[bg_idx + 3],
                        ];
                        let out = cursor::decode_masked_color_pixel(mask, bg);
                        pixels[bg_idx..bg_idx + 4].copy_from_slice(&out);
                    }
                }
            }
        }

        crate::cursor::make_color_texture(&self.device, width, height, &pixels)
    }

    fn read_back_region(&mut self, texture: &ID3D11Texture2D, rect: Rect) -> Result<Vec<u8>> {
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        let staging_desc = D3D11_TEXTURE2D_DESC {
            Width: rect.width() as u32,
            Height: rect.height() as u32,
            MipLevels: 1,
            ArraySize: 1,
            Format: desc.Format,
            SampleDesc: desc.SampleDesc,
            Usage: windows::Win32::Graphics::Direct3D11::D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: windows::Win32::Graphics::Direct3D11::D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: 0,
        };
        let mut staging: Option<ID3D11Texture2D> = None;
        unsafe { self.device.CreateTexture2D(&staging_desc, None, Some(&mut staging)) }
            .map_err(crate::error::FatalError::Other)?;
        let staging = staging.ok_or(crate::error::FatalError::Other(windows::core::Error::empty()))?;

        let src_box = rect_to_box(rect);
        unsafe {
            self.context.CopySubresourceRegion(&staging, 0, 0, 0, 0, texture, 0, Some(&src_box));
        }

        let mut mapped = Default::default();
        unsafe {
            self.context.Map(&staging, 0, windows::Win32::Graphics::Direct3D11::D3D11_MAP_READ, 0, Some(&mut mapped))
        }
        .map_err(crate::error::FatalError::Other)?;

        let width = rect.width() as usize;
        let height = rect.height() as usize;
        let mut pixels = vec![0u8; width * height * 4];
        for y in 0..height {
            let src = unsafe {
                std::slice::from_raw_parts(
                    (mapped.pData as *const u8).add(y * mapped.RowPitch as usize),
                    width * 4,
                )
            };
            pixels[y * width * 4..(y + 1) * width * 4].copy_from_slice(src);
        }
        unsafe { self.context.Unmap(&staging, 0) };
        Ok(pixels)
    }
}

fn rect_to_box(rect: Rect) -> D3D11_BOX {
    D3D11_BOX {
        left: rect.left as u32,
        top: rect.top as u32,
        front: 0,
        right: rect.right as u32,
        bottom: rect.bottom as u32,
        back: 1,
    }
}

fn create_srv(device: &ID3D11Device, texture: &ID3D11Texture2D) -> Result<ID3D11ShaderResourceView> {
    let mut srv: Option<ID3D11ShaderResourceView> = None;
    unsafe { device.CreateShaderResourceView(texture, None, Some(&mut srv)) }
        .map_err(crate::error::FatalError::Other)?;
    srv.ok_or(crate::error::FatalError::Other(windows::core::Error::empty()).into())
}

fn create_vertex_buffer(
    device: &ID3D11Device,
    vertices: &[Vertex],
) -> Result<windows::Win32::Graphics::Direct3D11::ID3D11Buffer> {
    use windows::Win32::Graphics::Direct3D11::{
        D3D11_BIND_VERTEX_BUFFER, D3D11_BUFFER_DESC, D3D11_SUBRESOURCE_DATA, D3D11_USAGE_IMMUTABLE,
    };
    let desc = D3D11_BUFFER_DESC {
        ByteWidth: (vertices.len() * std::mem::size_of::<Vertex>()) as u32,
        Usage: D3D11_USAGE_IMMUTABLE,
        BindFlags: D3D11_BIND_VERTEX_BUFFER.0 as u32,
        CPUAccessFlags: 0,
        MiscFlags: 0,
        StructureByteStride: 0,
    };
    let initial = D3D11_SUBRESOURCE_DATA {
        pSysMem: vertices.as_ptr() as *const _,
        SysMemPitch: 0,
        SysMemSlicePitch: 0,
    };
    let mut buffer = None;
    unsafe { device.CreateBuffer(&desc, Some(&initial), Some(&mut buffer)) }
        .map_err(crate::error::FatalError::Other)?;
    buffer.ok_or(crate::error::FatalError::Other(windows::core::Error::empty()).into())
}
