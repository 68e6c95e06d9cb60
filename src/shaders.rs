//! Shader sources and compilation helpers.
//!
//! Every program draws a rectangle as a four-vertex triangle strip whose
//! corner is derived from the vertex index (`(0,0) (1,0) (0,1) (1,1)`), and
//! maps desktop pixels to clip space through the `pview` transform
//! `[origin_x, origin_y, half_w, half_h]` (see [`ViewUniform`]).
//!
//! The GL backend uses GLSL 1.40 (OpenGL 3.1). The wgpu backend feeds
//! per-rectangle data as instance attributes; the Vulkan backend uses push
//! constants and compiles its WGSL to SPIR-V with naga at startup.
//!
//! [`ViewUniform`]: crate::quad::ViewUniform

/// Vertex shader for composited rectangles.
///
/// # Uniforms
///
/// | Name      | Type   | Description                                  |
/// |-----------|--------|----------------------------------------------|
/// | `u_pview` | `vec4` | View origin and half size                    |
/// | `u_rect`  | `vec4` | Clipped rectangle `[x, y, w, h]`             |
/// | `u_uv`    | `vec4` | Texture window `[u, v, du, dv]`              |
#[cfg(feature = "glow")]
pub const GL_QUAD_VERTEX_SRC: &str = r"#version 140

uniform vec4 u_pview;
uniform vec4 u_rect;
uniform vec4 u_uv;

out vec2 v_uv;

void main() {
    vec2 corner = vec2(float(gl_VertexID & 1), float(gl_VertexID >> 1));
    v_uv = u_uv.xy + corner * u_uv.zw;

    vec2 ndc = (u_rect.xy + corner * u_rect.zw - u_pview.xy) / u_pview.zw - 1.0;
    gl_Position = vec4(ndc.x, -ndc.y, 0.0, 1.0);
}
";

/// Fragment shader for composited rectangles.
///
/// Untextured rectangles bind a 1×1 white texture, so `u_color` alone
/// decides their color.
#[cfg(feature = "glow")]
pub const GL_QUAD_FRAGMENT_SRC: &str = r"#version 140

uniform sampler2D u_texture;
uniform vec4 u_color;

in vec2 v_uv;

out vec4 frag_color;

void main() {
    frag_color = texture(u_texture, v_uv) * u_color;
}
";

/// Vertex shader for the pick pass. Same geometry as the quad shader.
#[cfg(feature = "glow")]
pub const GL_PICK_VERTEX_SRC: &str = r"#version 140

uniform vec4 u_pview;
uniform vec4 u_rect;

void main() {
    vec2 corner = vec2(float(gl_VertexID & 1), float(gl_VertexID >> 1));
    vec2 ndc = (u_rect.xy + corner * u_rect.zw - u_pview.xy) / u_pview.zw - 1.0;
    gl_Position = vec4(ndc.x, -ndc.y, 0.0, 1.0);
}
";

/// Fragment shader for the pick pass: writes the widget token halves.
#[cfg(feature = "glow")]
pub const GL_PICK_FRAGMENT_SRC: &str = r"#version 140

uniform uvec2 u_id;

out uvec4 frag_id;

void main() {
    frag_id = uvec4(u_id, 0u, 0u);
}
";

/// WGSL for the wgpu backend: quad and pick entry points.
///
/// Group 0 holds the view transform; group 1 the texture and sampler.
/// Instance attributes follow [`QuadInstance`](crate::quad::QuadInstance)
/// and [`PickInstance`](crate::quad::PickInstance).
#[cfg(feature = "wgpu")]
pub const WGPU_WGSL: &str = r"
struct ViewUniform {
    pview: vec4<f32>,
};

@group(0) @binding(0) var<uniform> view: ViewUniform;
@group(1) @binding(0) var tex: texture_2d<f32>;
@group(1) @binding(1) var samp: sampler;

fn corner(vi: u32) -> vec2<f32> {
    return vec2<f32>(f32(vi & 1u), f32(vi >> 1u));
}

fn to_clip(pos: vec2<f32>) -> vec4<f32> {
    let ndc = (pos - view.pview.xy) / view.pview.zw - 1.0;
    return vec4<f32>(ndc.x, -ndc.y, 0.0, 1.0);
}

struct QuadIn {
    @location(0) rect: vec4<f32>,
    @location(1) uv: vec4<f32>,
    @location(2) color: vec4<f32>,
};

struct QuadOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) uv: vec2<f32>,
    @location(1) color: vec4<f32>,
};

@vertex
fn vs_quad(@builtin(vertex_index) vi: u32, quad: QuadIn) -> QuadOut {
    let c = corner(vi);
    var out: QuadOut;
    out.pos = to_clip(quad.rect.xy + c * quad.rect.zw);
    out.uv = quad.uv.xy + c * quad.uv.zw;
    out.color = quad.color;
    return out;
}

@fragment
fn fs_quad(frag: QuadOut) -> @location(0) vec4<f32> {
    return textureSample(tex, samp, frag.uv) * frag.color;
}

struct PickIn {
    @location(0) rect: vec4<f32>,
    @location(1) id: vec2<u32>,
};

struct PickOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) @interpolate(flat) id: vec2<u32>,
};

@vertex
fn vs_pick(@builtin(vertex_index) vi: u32, pick: PickIn) -> PickOut {
    var out: PickOut;
    out.pos = to_clip(pick.rect.xy + corner(vi) * pick.rect.zw);
    out.id = pick.id;
    return out;
}

@fragment
fn fs_pick(frag: PickOut) -> @location(0) vec2<u32> {
    return frag.id;
}
";

/// WGSL for the Vulkan quad pipeline; per-draw data in push constants.
#[cfg(feature = "vulkan")]
pub const VK_QUAD_WGSL: &str = r"
struct QuadPush {
    pview: vec4<f32>,
    rect: vec4<f32>,
    uv: vec4<f32>,
    color: vec4<f32>,
};

var<push_constant> quad: QuadPush;

@group(0) @binding(0) var tex: texture_2d<f32>;
@group(0) @binding(1) var samp: sampler;

struct QuadOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) vi: u32) -> QuadOut {
    let c = vec2<f32>(f32(vi & 1u), f32(vi >> 1u));
    let ndc = (quad.rect.xy + c * quad.rect.zw - quad.pview.xy) / quad.pview.zw - 1.0;
    var out: QuadOut;
    out.pos = vec4<f32>(ndc.x, -ndc.y, 0.0, 1.0);
    out.uv = quad.uv.xy + c * quad.uv.zw;
    return out;
}

@fragment
fn fs_main(frag: QuadOut) -> @location(0) vec4<f32> {
    return textureSample(tex, samp, frag.uv) * quad.color;
}
";

/// WGSL for the Vulkan pick pipeline.
#[cfg(feature = "vulkan")]
pub const VK_PICK_WGSL: &str = r"
struct PickPush {
    pview: vec4<f32>,
    rect: vec4<f32>,
    id: vec2<u32>,
    pad: vec2<u32>,
};

var<push_constant> pick: PickPush;

@vertex
fn vs_main(@builtin(vertex_index) vi: u32) -> @builtin(position) vec4<f32> {
    let c = vec2<f32>(f32(vi & 1u), f32(vi >> 1u));
    let ndc = (pick.rect.xy + c * pick.rect.zw - pick.pview.xy) / pick.pview.zw - 1.0;
    return vec4<f32>(ndc.x, -ndc.y, 0.0, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec2<u32> {
    return pick.id;
}
";

/// WGSL compute kernels of the GPU format converter.
///
/// Each invocation expands four texels. `expand_rgb` reads three words of
/// packed 3-byte texels, `expand_indexed` one word of four palette indices.
/// `offset` is the first invocation of a dispatch, in units of four texels.
/// Output words are RGBA8 in little-endian byte order.
#[cfg(feature = "vulkan")]
pub const VK_CONVERT_WGSL: &str = r"
struct Params {
    texels: u32,
    bgr: u32,
    offset: u32,
};

var<push_constant> params: Params;

@group(0) @binding(0) var<storage, read> src: array<u32>;
@group(0) @binding(1) var<storage, read_write> dst: array<u32>;
@group(0) @binding(2) var<storage, read> palette: array<u32>;

fn rgba_word(t: u32) -> u32 {
    if (params.bgr != 0u) {
        return ((t & 0xFFu) << 16u) | (t & 0xFF00u) | ((t >> 16u) & 0xFFu) | 0xFF000000u;
    }
    return (t & 0xFFFFFFu) | 0xFF000000u;
}

@compute @workgroup_size(32)
fn expand_rgb(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x + params.offset;
    let base = i * 4u;
    if (base >= params.texels) {
        return;
    }
    let w0 = src[i * 3u];
    let w1 = src[i * 3u + 1u];
    let w2 = src[i * 3u + 2u];
    dst[base] = rgba_word(w0 & 0xFFFFFFu);
    dst[base + 1u] = rgba_word((w0 >> 24u) | ((w1 & 0xFFFFu) << 8u));
    dst[base + 2u] = rgba_word((w1 >> 16u) | ((w2 & 0xFFu) << 16u));
    dst[base + 3u] = rgba_word(w2 >> 8u);
}

@compute @workgroup_size(32)
fn expand_indexed(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x + params.offset;
    let base = i * 4u;
    if (base >= params.texels) {
        return;
    }
    let w = src[i];
    dst[base] = palette[w & 0xFFu];
    dst[base + 1u] = palette[(w >> 8u) & 0xFFu];
    dst[base + 2u] = palette[(w >> 16u) & 0xFFu];
    dst[base + 3u] = palette[w >> 24u];
}
";

/// Compile a GL program from vertex and fragment sources.
///
/// The shader objects are detached and deleted after linking, so only the
/// program needs cleanup.
///
/// # Safety
///
/// Requires a valid, current OpenGL context.
///
/// # Errors
///
/// Returns [`RendererError::Shader`](crate::RendererError::Shader) with the
/// driver log if compilation or linking fails.
#[cfg(feature = "glow")]
pub unsafe fn compile_program(
    gl: &glow::Context,
    vertex_src: &str,
    fragment_src: &str,
) -> crate::Result<glow::Program> {
    use glow::HasContext;
    use crate::RendererError;

    let vs = unsafe { compile_shader(gl, glow::VERTEX_SHADER, vertex_src) }?;
    let fs = match unsafe { compile_shader(gl, glow::FRAGMENT_SHADER, fragment_src) } {
        Ok(fs) => fs,
        Err(err) => {
            unsafe { gl.delete_shader(vs) };
            return Err(err);
        }
    };

    unsafe {
        let program = match gl.create_program() {
            Ok(program) => program,
            Err(err) => {
                gl.delete_shader(vs);
                gl.delete_shader(fs);
                return Err(RendererError::api("glCreateProgram", err));
            }
        };
        gl.attach_shader(program, vs);
        gl.attach_shader(program, fs);
        gl.link_program(program);
        gl.detach_shader(program, vs);
        gl.detach_shader(program, fs);
        gl.delete_shader(vs);
        gl.delete_shader(fs);

        if !gl.get_program_link_status(program) {
            let log = gl.get_program_info_log(program);
            gl.delete_program(program);
            return Err(RendererError::shader(format!("link: {log}")));
        }
        Ok(program)
    }
}

/// Look up a uniform that the program must declare.
///
/// # Safety
///
/// Requires a valid, current OpenGL context.
///
/// # Errors
///
/// Returns [`RendererError::Shader`](crate::RendererError::Shader) if the
/// uniform is missing or was optimized out.
#[cfg(feature = "glow")]
pub unsafe fn uniform(
    gl: &glow::Context,
    program: glow::Program,
    name: &str,
) -> crate::Result<glow::UniformLocation> {
    use glow::HasContext;

    unsafe { gl.get_uniform_location(program, name) }
        .ok_or_else(|| crate::RendererError::shader(format!("uniform {name} missing")))
}

/// Compile one shader stage.
///
/// # Safety
///
/// Requires a valid, current OpenGL context.
#[cfg(feature = "glow")]
unsafe fn compile_shader(
    gl: &glow::Context,
    stage: u32,
    source: &str,
) -> crate::Result<glow::Shader> {
    use glow::HasContext;
    use crate::RendererError;

    unsafe {
        let shader = gl
            .create_shader(stage)
            .map_err(|err| RendererError::api("glCreateShader", err))?;
        gl.shader_source(shader, source);
        gl.compile_shader(shader);

        if !gl.get_shader_compile_status(shader) {
            let log = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            return Err(RendererError::shader(format!("compile: {log}")));
        }
        Ok(shader)
    }
}

/// Translate WGSL to SPIR-V words.
///
/// # Errors
///
/// Returns [`RendererError::Shader`](crate::RendererError::Shader) with a
/// rendered diagnostic when parsing, validation or emission fails.
#[cfg(feature = "vulkan")]
pub fn wgsl_to_spirv(source: &str) -> crate::Result<Vec<u32>> {
    use crate::RendererError;
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    let module = naga::front::wgsl::parse_str(source)
        .map_err(|err| RendererError::shader(err.emit_to_string(source)))?;
    let info = Validator::new(ValidationFlags::all(), Capabilities::PUSH_CONSTANT)
        .validate(&module)
        .map_err(|err| RendererError::shader(err.to_string()))?;
    naga::back::spv::write_vec(&module, &info, &naga::back::spv::Options::default(), None)
        .map_err(|err| RendererError::shader(err.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    #[cfg(feature = "vulkan")]
    #[test]
    fn vulkan_shaders_translate() {
        for source in [super::VK_QUAD_WGSL, super::VK_PICK_WGSL, super::VK_CONVERT_WGSL] {
            let words = super::wgsl_to_spirv(source).unwrap();
            // SPIR-V magic number.
            assert_eq!(words[0], 0x0723_0203);
        }
    }

    #[cfg(feature = "vulkan")]
    #[test]
    fn broken_wgsl_reports_shader_error() {
        let err = super::wgsl_to_spirv("fn broken( {").unwrap_err();
        assert!(err.to_string().starts_with("shader error:"));
    }

    #[cfg(feature = "wgpu")]
    #[test]
    fn wgpu_shader_declares_all_entry_points() {
        for entry in ["fn vs_quad", "fn fs_quad", "fn vs_pick", "fn fs_pick"] {
            assert!(super::WGPU_WGSL.contains(entry), "{entry} missing");
        }
    }

    #[cfg(feature = "glow")]
    #[test]
    fn glsl_sources_share_version() {
        for source in [
            super::GL_QUAD_VERTEX_SRC,
            super::GL_QUAD_FRAGMENT_SRC,
            super::GL_PICK_VERTEX_SRC,
            super::GL_PICK_FRAGMENT_SRC,
        ] {
            assert!(source.starts_with("#version 140"));
        }
    }
}
