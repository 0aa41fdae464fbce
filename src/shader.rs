//! Compiled shaders and fixed-function state shared by the dirty-rect and
//! cursor-composite draw calls.
//!
//! The shaders are compiled at runtime with `D3DCompile` rather than shipped
//! as precompiled bytecode, so the crate carries no build-time HLSL
//! toolchain dependency — the same tradeoff `Win32_Graphics_Direct3D_Fxc`
//! exists for in this ecosystem.

use windows::Win32::Graphics::Direct3D::Fxc::D3DCompile;
use windows::Win32::Graphics::Direct3D::ID3DBlob;
use windows::Win32::Graphics::Direct3D11::{
    ID3D11BlendState, ID3D11Device, ID3D11InputLayout, ID3D11PixelShader, ID3D11SamplerState,
    ID3D11VertexShader, D3D11_APPEND_ALIGNED_ELEMENT, D3D11_BLEND_DESC, D3D11_BLEND_INV_SRC_ALPHA,
    D3D11_BLEND_ONE, D3D11_BLEND_OP_ADD, D3D11_BLEND_SRC_ALPHA, D3D11_BLEND_ZERO,
    D3D11_COLOR_WRITE_ENABLE_ALL, D3D11_COMPARISON_NEVER, D3D11_FILTER_MIN_MAG_MIP_LINEAR,
    D3D11_INPUT_ELEMENT_DESC, D3D11_INPUT_PER_VERTEX_DATA, D3D11_RENDER_TARGET_BLEND_DESC,
    D3D11_SAMPLER_DESC, D3D11_TEXTURE_ADDRESS_CLAMP,
};
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_R32G32B32_FLOAT, DXGI_FORMAT_R32G32_FLOAT};
use windows::core::{s, PCSTR};

use crate::error::{FatalError, Result};

const VERTEX_SHADER_SOURCE: &str = r"
struct VSInput { float3 pos : POSITION; float2 uv : TEXCOORD0; };
struct VSOutput { float4 pos : SV_POSITION; float2 uv : TEXCOORD0; };
VSOutput main(VSInput input) {
    VSOutput output;
    output.pos = float4(input.pos, 1.0);
    output.uv = input.uv;
    return output;
}
";

const PIXEL_SHADER_SOURCE: &str = r"
Texture2D tex : register(t0);
SamplerState samp : register(s0);
float4 main(float4 pos : SV_POSITION, float2 uv : TEXCOORD0) : SV_TARGET {
    return tex.Sample(samp, uv);
}
";

/// Vertex/pixel shaders, input layout, linear sampler and alpha-blend state,
/// built once per Pipeline device and reused across every tick.
pub struct ShaderCache {
    vertex_shader: ID3D11VertexShader,
    input_layout: ID3D11InputLayout,
    pixel_shader: ID3D11PixelShader,
    linear_sampler: ID3D11SamplerState,
    blend_state: ID3D11BlendState,
}

impl ShaderCache {
    pub fn new(device: &ID3D11Device) -> Result<Self> {
        let vs_blob = compile(VERTEX_SHADER_SOURCE, s!("main"), s!("vs_5_0"))?;
        let vs_bytes = blob_bytes(&vs_blob);

        let mut vertex_shader: Option<ID3D11VertexShader> = None;
        unsafe { device.CreateVertexShader(vs_bytes, None, Some(&mut vertex_shader)) }
            .map_err(FatalError::Other)?;
        let vertex_shader = vertex_shader.ok_or(FatalError::Other(windows::core::Error::empty()))?;

        let input_desc = [
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("POSITION"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32B32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 0,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("TEXCOORD"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: D3D11_APPEND_ALIGNED_ELEMENT,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
        ];
        let mut input_layout: Option<ID3D11InputLayout> = None;
        unsafe { device.CreateInputLayout(&input_desc, vs_bytes, Some(&mut input_layout)) }
            .map_err(FatalError::Other)?;
        let input_layout = input_layout.ok_or(FatalError::Other(windows::core::Error::empty()))?;

        let ps_blob = compile(PIXEL_SHADER_SOURCE, s!("main"), s!("ps_5_0"))?;
        let mut pixel_shader: Option<ID3D11PixelShader> = None;
        unsafe { device.CreatePixelShader(blob_bytes(&ps_blob), None, Some(&mut pixel_shader)) }
            .map_err(FatalError::Other)?;
        let pixel_shader = pixel_shader.ok_or(FatalError::Other(windows::core::Error::empty()))?;

        let sampler_desc = D3D11_SAMPLER_DESC {
            Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
            AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
            AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
            ComparisonFunc: D3D11_COMPARISON_NEVER,
            MinLOD: 0.0,
            MaxLOD: f32::MAX,
            ..Default::default()
        };
        let mut linear_sampler: Option<ID3D11SamplerState> = None;
        unsafe { device.CreateSamplerState(&sampler_desc, Some(&mut linear_sampler)) }
            .map_err(FatalError::Other)?;
        let linear_sampler = linear_sampler.ok_or(FatalError::Other(windows::core::Error::empty()))?;

        let mut blend_desc = D3D11_BLEND_DESC::default();
        blend_desc.RenderTarget[0] = D3D11_RENDER_TARGET_BLEND_DESC {
            BlendEnable: true.into(),
            SrcBlend: D3D11_BLEND_SRC_ALPHA,
            DestBlend: D3D11_BLEND_INV_SRC_ALPHA,
            BlendOp: D3D11_BLEND_OP_ADD,
            SrcBlendAlpha: D3D11_BLEND_ONE,
            DestBlendAlpha: D3D11_BLEND_ZERO,
            BlendOpAlpha: D3D11_BLEND_OP_ADD,
            RenderTargetWriteMask: D3D11_COLOR_WRITE_ENABLE_ALL.0 as u8,
        };
        let mut blend_state: Option<ID3D11BlendState> = None;
        unsafe { device.CreateBlendState(&blend_desc, Some(&mut blend_state)) }
            .map_err(FatalError::Other)?;
        let blend_state = blend_state.ok_or(FatalError::Other(windows::core::Error::empty()))?;

        Ok(Self {
            vertex_shader,
            input_layout,
            pixel_shader,
            linear_sampler,
            blend_state,
        })
    }

    pub fn vertex_shader(&self) -> &ID3D11VertexShader {
        &self.vertex_shader
    }

    pub fn input_layout(&self) -> &ID3D11InputLayout {
        &self.input_layout
    }

    pub fn pixel_shader(&self) -> &ID3D11PixelShader {
        &self.pixel_shader
    }

    pub fn linear_sampler(&self) -> &ID3D11SamplerState {
        &self.linear_sampler
    }

    /// Standard src-alpha / inv-src-alpha blend state, used only for the
    /// cursor composite (dirty-rect replay itself draws with blending
    /// disabled).
    pub fn blend_state(&self) -> &ID3D11BlendState {
        &self.blend_state
    }
}

fn compile(source: &str, entry_point: PCSTR, target: PCSTR) -> Result<ID3DBlob> {
    let mut code: Option<ID3DBlob> = None;
    let mut errors: Option<ID3DBlob> = None;
    let result = unsafe {
        D3DCompile(
            source.as_ptr() as *const _,
            source.len(),
            None,
            None,
            None,
            entry_point,
            target,
            0,
            0,
            &mut code,
            Some(&mut errors),
        )
    };
    if let Err(e) = result {
        if let Some(errors) = errors {
            let msg = blob_to_string(&errors);
            return Err(FatalError::Other(windows::core::Error::new(e.code(), msg)).into());
        }
        return Err(FatalError::Other(e).into());
    }
    code.ok_or_else(|| FatalError::Other(windows::core::Error::empty()).into())
}

fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
    }
}

fn blob_to_string(blob: &ID3DBlob) -> String {
    String::from_utf8_lossy(blob_bytes(blob)).into_owned()
}
