// Averages the accumulated color buffer, applies exposure and encodes 8-bit sRGB.
// In low resolution frames every block copies its sampled top-left pixel.
vulkano_shaders::shader! {
    ty: "compute",
    src: r"
#version 460
#extension GL_EXT_scalar_block_layout: require

layout(local_size_x = 8, local_size_y = 8, local_size_z = 1) in;

layout(set = 0, binding = 0, scalar) readonly buffer ColorBuffer {
    vec3 color[];
};

layout(set = 0, binding = 1) writeonly buffer OutputBuffer {
    uint display[];
};

layout(push_constant, scalar) uniform ResolveConstants {
    uint width;
    uint height;
    uint sample_number;
    float exposure;
    uint block_size;
};

vec3 linearToSrgb(vec3 v) {
    bvec3 low = lessThanEqual(v, vec3(0.0031308));
    vec3 lo = 12.92 * v;
    vec3 hi = 1.055 * pow(max(v, vec3(0.0)), vec3(1.0 / 2.4)) - 0.055;
    return mix(hi, lo, low);
}

void main() {
    uvec2 pixel = gl_GlobalInvocationID.xy;
    if (pixel.x >= width || pixel.y >= height) {
        return;
    }
    uvec2 source = pixel - pixel % block_size;
    vec3 c = color[source.y * width + source.x];
    float scale = exposure / float(max(sample_number, 1u));
    vec3 encoded = clamp(linearToSrgb(c * scale), 0.0, 1.0);
    display[pixel.y * width + pixel.x] = packUnorm4x8(vec4(encoded, 1.0));
}
",
}
