//! GLSL source of the path tracing kernel. Compiled at runtime so the sampling strategies
//! and the acceleration mode can be selected with preprocessor macros.
//!
//! Bindings (set 0), all storage buffers use the scalar layout of the matching Rust types:
//! 0 parameters, 1 camera, 2-9 scene, 10-14 frame buffers, 15-17 status counters,
//! 18 environment CDF, 19 acceleration structure, 20 environment image, 21 textures.

pub const SOURCE: &str = r"
#version 460
#extension GL_EXT_scalar_block_layout: require
#extension GL_EXT_nonuniform_qualifier: require

#ifndef DIRECT_LIGHT_SAMPLING_STRATEGY
#define DIRECT_LIGHT_SAMPLING_STRATEGY 1
#endif
#ifndef ENVMAP_SAMPLING_STRATEGY
#define ENVMAP_SAMPLING_STRATEGY 1
#endif
#ifndef USE_HARDWARE_ACCELERATION
#define USE_HARDWARE_ACCELERATION 1
#endif

#if USE_HARDWARE_ACCELERATION
#extension GL_EXT_ray_query: require
#endif

#define M_PI 3.1415926535897932384626433832795
#define RAY_OFFSET 0.001
#define T_MAX 1e30
#define NAN_DEBUG_COLOR vec3(1e15, 0.0, 1e15)

#define AMBIENT_NONE 0u
#define AMBIENT_UNIFORM 1u
#define AMBIENT_ENVMAP 2u

#define FROZEN_SEED 0x2545f491u
#define SAMPLE_SEED 0x9e3779b9u

layout(local_size_x = 8, local_size_y = 8, local_size_z = 1) in;

struct Material {
    vec3 base_color;
    float roughness;
    vec3 emission;
    float metallic;
    float specular;
    float specular_transmission;
    float ior;
    int base_color_texture;
    int roughness_metallic_texture;
};

layout(set = 0, binding = 0, scalar) readonly buffer ParamsBuffer {
    uint width;
    uint height;
    uint sample_number;
    uint frame_number;
    uint samples_per_frame;
    uint max_bounces;
    uint max_samples;
    uint enable_adaptive_sampling;
    uint adaptive_sampling_min_samples;
    float adaptive_sampling_noise_threshold;
    uint enable_noise_stop;
    float noise_stop_threshold;
    uint render_low_resolution;
    uint low_resolution_scaling;
    uint freeze_random;
    uint display_nans;
    uint has_adaptive_buffers;
    uint ambient_light_type;
    vec3 uniform_light_color;
    float envmap_intensity;
    uint envmap_scale_background_intensity;
    uint envmap_width;
    uint envmap_height;
    uint emissive_triangle_count;
    uint triangle_count;
    uint has_texcoords;
} params;

layout(set = 0, binding = 1, scalar) readonly buffer CameraBuffer {
    mat4 inverse_view;
    mat4 inverse_projection;
    vec3 position;
    float _pad;
} camera;

layout(set = 0, binding = 2, scalar) readonly buffer TriangleIndices { uint triangle_indices[]; };
layout(set = 0, binding = 3, scalar) readonly buffer VertexPositions { vec3 vertex_positions[]; };
layout(set = 0, binding = 4, scalar) readonly buffer HasVertexNormals { uint has_vertex_normals[]; };
layout(set = 0, binding = 5, scalar) readonly buffer VertexNormals { vec3 vertex_normals[]; };
layout(set = 0, binding = 6, scalar) readonly buffer Texcoords { vec2 texcoords[]; };
layout(set = 0, binding = 7, scalar) readonly buffer MaterialIndices { uint material_indices[]; };
layout(set = 0, binding = 8, scalar) readonly buffer Materials { Material materials[]; };
layout(set = 0, binding = 9, scalar) readonly buffer EmissiveTriangles { uint emissive_triangle_indices[]; };

layout(set = 0, binding = 10, scalar) buffer ColorBuffer { vec3 color[]; };
layout(set = 0, binding = 11, scalar) buffer NormalBuffer { vec3 aov_normal[]; };
layout(set = 0, binding = 12, scalar) buffer AlbedoBuffer { vec3 aov_albedo[]; };
layout(set = 0, binding = 13, scalar) buffer SampleCounts { uint sample_counts[]; };
layout(set = 0, binding = 14, scalar) buffer SquaredLuminance { float squared_luminance[]; };

layout(set = 0, binding = 15, scalar) buffer StillActive { uint still_one_ray_active; };
layout(set = 0, binding = 16, scalar) buffer ConvergedCount { uint pixel_converged_count; };
layout(set = 0, binding = 17, scalar) buffer InvalidCount { uint invalid_sample_count; };

layout(set = 0, binding = 18, scalar) readonly buffer EnvmapCdf { float envmap_cdf[]; };
#if USE_HARDWARE_ACCELERATION
layout(set = 0, binding = 19) uniform accelerationStructureEXT top_level_acceleration_structure;
#endif
layout(set = 0, binding = 20) uniform sampler2D envmap;
layout(set = 0, binding = 21) uniform sampler2D textures[];

// Construct a float with half-open range [0:1] using low 23 bits.
float floatConstruct(uint m) {
    const uint ieeeMantissa = 0x007FFFFFu;
    const uint ieeeOne = 0x3F800000u;
    m &= ieeeMantissa;
    m |= ieeeOne;
    return uintBitsToFloat(m) - 1.0;
}

uint murmur3_combine(uint h, uint k) {
    k *= 0x1b873593u;
    h ^= k;
    h = (h << 13) | (h >> 19);
    return h * 5u + 0xe6546b64u;
}

uint murmur3_finalize(uint h) {
    h ^= h >> 16;
    h *= 0x85ebca6bu;
    h ^= h >> 13;
    h *= 0xc2b2ae35u;
    h ^= h >> 16;
    return h;
}

uint pixelSeed(uint pixel_index) {
    uint h = params.freeze_random != 0 ? FROZEN_SEED : murmur3_combine(SAMPLE_SEED, params.sample_number);
    return murmur3_finalize(murmur3_combine(h, pixel_index));
}

uint rng_state;

float nextFloat() {
    uint x = rng_state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    rng_state = x;
    return floatConstruct(x);
}

float luminance(vec3 c) {
    return dot(c, vec3(0.2126, 0.7152, 0.0722));
}

// Duff et al. 2017
void orthonormalBasis(vec3 n, out vec3 t, out vec3 b) {
    float s = n.z >= 0.0 ? 1.0 : -1.0;
    float a = -1.0 / (s + n.z);
    float c = n.x * n.y * a;
    t = vec3(1.0 + s * n.x * n.x * a, s * c, -s * n.x);
    b = vec3(c, s + n.y * n.y * a, -n.y);
}

vec3 localToWorld(vec3 v, vec3 n) {
    vec3 t;
    vec3 b;
    orthonormalBasis(n, t, b);
    return t * v.x + b * v.y + n * v.z;
}

vec3 cosineSampleHemisphere(float u1, float u2) {
    float r = sqrt(u1);
    float phi = 2.0 * M_PI * u2;
    return vec3(r * cos(phi), r * sin(phi), sqrt(max(0.0, 1.0 - u1)));
}

vec3 uniformTrianglePoint(vec3[3] tri, float u1, float u2) {
    float su = sqrt(u1);
    return tri[0] * (1.0 - su) + tri[1] * (su * (1.0 - u2)) + tri[2] * (su * u2);
}

vec3 reflectAbout(vec3 wo, vec3 n) {
    return 2.0 * dot(wo, n) * n - wo;
}

float fresnelDielectric(float cos_i, float eta) {
    cos_i = clamp(cos_i, 0.0, 1.0);
    float sin2_t = eta * eta * (1.0 - cos_i * cos_i);
    if(sin2_t >= 1.0) {
        return 1.0;
    }
    float cos_t = sqrt(1.0 - sin2_t);
    float rs = (eta * cos_i - cos_t) / (eta * cos_i + cos_t);
    float rp = (cos_i - eta * cos_t) / (cos_i + eta * cos_t);
    return 0.5 * (rs * rs + rp * rp);
}

bool refractAbout(vec3 wo, vec3 n, float eta, out vec3 wi) {
    float cos_i = dot(wo, n);
    float sin2_t = eta * eta * max(0.0, 1.0 - cos_i * cos_i);
    if(sin2_t >= 1.0) {
        return false;
    }
    float cos_t = sqrt(1.0 - sin2_t);
    wi = normalize(-eta * wo + (eta * cos_i - cos_t) * n);
    return true;
}

// ---- geometry ----

uvec3 triangleVertexIndices(uint prim) {
    return uvec3(
        triangle_indices[prim * 3],
        triangle_indices[prim * 3 + 1],
        triangle_indices[prim * 3 + 2]
    );
}

vec3[3] triangleVertices(uint prim) {
    uvec3 i = triangleVertexIndices(prim);
    return vec3[3](vertex_positions[i.x], vertex_positions[i.y], vertex_positions[i.z]);
}

struct Hit {
    bool hit;
    uint prim;
    float t;
    vec2 bary;
};

// Moller-Trumbore, bary.x weights the second vertex
bool intersectTriangle(vec3 origin, vec3 direction, vec3[3] tri, float t_min, float t_max, out float t, out vec2 bary) {
    vec3 edge1 = tri[1] - tri[0];
    vec3 edge2 = tri[2] - tri[0];
    vec3 pvec = cross(direction, edge2);
    float det = dot(edge1, pvec);
    if(abs(det) < 1e-9) {
        return false;
    }
    float inv_det = 1.0 / det;
    vec3 tvec = origin - tri[0];
    float u = dot(tvec, pvec) * inv_det;
    if(u < 0.0 || u > 1.0) {
        return false;
    }
    vec3 qvec = cross(tvec, edge1);
    float v = dot(direction, qvec) * inv_det;
    if(v < 0.0 || u + v > 1.0) {
        return false;
    }
    t = dot(edge2, qvec) * inv_det;
    bary = vec2(u, v);
    return t > t_min && t < t_max;
}

Hit closestHit(vec3 origin, vec3 direction) {
    Hit hit = Hit(false, 0u, T_MAX, vec2(0.0));
#if USE_HARDWARE_ACCELERATION
    rayQueryEXT ray_query;
    rayQueryInitializeEXT(
        ray_query,
        top_level_acceleration_structure,
        gl_RayFlagsOpaqueEXT,
        0xFF,
        origin,
        0.0,
        direction,
        T_MAX
    );
    while(rayQueryProceedEXT(ray_query)) {
    }
    if(rayQueryGetIntersectionTypeEXT(ray_query, true) == gl_RayQueryCommittedIntersectionTriangleEXT) {
        hit.hit = true;
        hit.prim = rayQueryGetIntersectionPrimitiveIndexEXT(ray_query, true);
        hit.t = rayQueryGetIntersectionTEXT(ray_query, true);
        hit.bary = rayQueryGetIntersectionBarycentricsEXT(ray_query, true);
    }
#else
    for(uint prim = 0; prim < params.triangle_count; prim++) {
        float t;
        vec2 bary;
        if(intersectTriangle(origin, direction, triangleVertices(prim), 0.0, hit.t, t, bary)) {
            hit = Hit(true, prim, t, bary);
        }
    }
#endif
    return hit;
}

bool anyHit(vec3 origin, vec3 direction, float t_max) {
#if USE_HARDWARE_ACCELERATION
    rayQueryEXT ray_query;
    rayQueryInitializeEXT(
        ray_query,
        top_level_acceleration_structure,
        gl_RayFlagsOpaqueEXT | gl_RayFlagsTerminateOnFirstHitEXT,
        0xFF,
        origin,
        0.0,
        direction,
        t_max
    );
    while(rayQueryProceedEXT(ray_query)) {
    }
    return rayQueryGetIntersectionTypeEXT(ray_query, true) == gl_RayQueryCommittedIntersectionTriangleEXT;
#else
    for(uint prim = 0; prim < params.triangle_count; prim++) {
        float t;
        vec2 bary;
        if(intersectTriangle(origin, direction, triangleVertices(prim), 0.0, t_max, t, bary)) {
            return true;
        }
    }
    return false;
#endif
}

bool occluded(vec3 origin, vec3 target) {
    vec3 offset = target - origin;
    float dist = length(offset);
    if(dist <= 0.0) {
        return false;
    }
    return anyHit(origin, offset / dist, dist * (1.0 - 1e-4));
}

// ---- surfaces ----

struct SurfaceMaterial {
    vec3 base_color;
    vec3 emission;
    float roughness;
    float metallic;
    float specular;
    float specular_transmission;
    float ior;
};

struct Surface {
    vec3 position;
    vec3 geometric_normal;
    vec3 shading_normal;
    SurfaceMaterial material;
};

vec3 spawnOrigin(Surface surface, vec3 direction) {
    float side = dot(direction, surface.geometric_normal) >= 0.0 ? 1.0 : -1.0;
    return surface.position + surface.geometric_normal * (RAY_OFFSET * side);
}

bool isEmissive(SurfaceMaterial m) {
    return m.emission.r > 0.0 || m.emission.g > 0.0 || m.emission.b > 0.0;
}

SurfaceMaterial surfaceMaterial(Material material, bool has_uv, vec2 uv) {
    vec3 base_color = material.base_color;
    float roughness = material.roughness;
    float metallic = material.metallic;
    if(has_uv) {
        if(material.base_color_texture >= 0) {
            base_color *= textureLod(textures[nonuniformEXT(material.base_color_texture)], uv, 0.0).rgb;
        }
        if(material.roughness_metallic_texture >= 0) {
            vec4 texel = textureLod(textures[nonuniformEXT(material.roughness_metallic_texture)], uv, 0.0);
            roughness *= texel.g;
            metallic *= texel.b;
        }
    }
    return SurfaceMaterial(
        base_color,
        material.emission,
        clamp(roughness, 0.0, 1.0),
        clamp(metallic, 0.0, 1.0),
        clamp(material.specular, 0.0, 1.0),
        clamp(material.specular_transmission, 0.0, 1.0),
        max(material.ior, 1.0)
    );
}

Surface resolveHit(vec3 origin, vec3 direction, Hit hit) {
    uvec3 i = triangleVertexIndices(hit.prim);
    vec3[3] tri = triangleVertices(hit.prim);
    float w = 1.0 - hit.bary.x - hit.bary.y;

    vec3 position = origin + direction * hit.t;
    vec3 geometric_normal = normalize(cross(tri[1] - tri[0], tri[2] - tri[0]));

    vec3 shading_normal = geometric_normal;
    if(has_vertex_normals[i.x] != 0 && has_vertex_normals[i.y] != 0 && has_vertex_normals[i.z] != 0) {
        vec3 n = vertex_normals[i.x] * w + vertex_normals[i.y] * hit.bary.x + vertex_normals[i.z] * hit.bary.y;
        if(dot(n, n) > 1e-16) {
            n = normalize(n);
            shading_normal = dot(n, geometric_normal) < 0.0 ? -n : n;
        }
    }

    bool has_uv = params.has_texcoords != 0;
    vec2 uv = vec2(0.0);
    if(has_uv) {
        uv = texcoords[i.x] * w + texcoords[i.y] * hit.bary.x + texcoords[i.z] * hit.bary.y;
    }

    Material material = materials[material_indices[hit.prim]];
    return Surface(position, geometric_normal, shading_normal, surfaceMaterial(material, has_uv, uv));
}

// ---- bsdf ----

float materialAlpha(SurfaceMaterial m) {
    return max(m.roughness * m.roughness, 1e-3);
}

float specularWeight(SurfaceMaterial m) {
    return m.specular + (1.0 - m.specular) * m.metallic;
}

float specularProbability(SurfaceMaterial m) {
    return clamp(0.5 * (specularWeight(m) + m.metallic), 0.0, 1.0);
}

vec3 fresnelSchlick(vec3 f0, float v_dot_h) {
    float m = pow(clamp(1.0 - v_dot_h, 0.0, 1.0), 5.0);
    return f0 + (vec3(1.0) - f0) * m;
}

float ggxDistribution(float n_dot_h, float alpha) {
    float a2 = alpha * alpha;
    float d = n_dot_h * n_dot_h * (a2 - 1.0) + 1.0;
    return a2 / (M_PI * d * d);
}

float smithG1(float n_dot_x, float alpha) {
    float a2 = alpha * alpha;
    return 2.0 * n_dot_x / (n_dot_x + sqrt(a2 + (1.0 - a2) * n_dot_x * n_dot_x));
}

// returns f in xyz and the pdf of the reflective lobes in w
vec4 evalReflection(SurfaceMaterial m, vec3 wo, vec3 wi, vec3 n) {
    float n_dot_v = dot(n, wo);
    float n_dot_l = dot(n, wi);
    if(n_dot_v <= 0.0 || n_dot_l <= 0.0) {
        return vec4(0.0);
    }
    vec3 h = normalize(wo + wi);
    float n_dot_h = max(dot(n, h), 0.0);
    float v_dot_h = max(dot(wo, h), 1e-6);

    float alpha = materialAlpha(m);
    float spec_weight = specularWeight(m);
    vec3 f0 = mix(vec3(0.04), m.base_color, m.metallic);
    vec3 fresnel = fresnelSchlick(f0, v_dot_h);

    vec3 k_d = (vec3(1.0) - spec_weight * fresnel) * (1.0 - m.metallic);
    vec3 diffuse = k_d * m.base_color / M_PI;

    float d = ggxDistribution(n_dot_h, alpha);
    float g = smithG1(n_dot_v, alpha) * smithG1(n_dot_l, alpha);
    vec3 specular = fresnel * (spec_weight * d * g / (4.0 * n_dot_v * n_dot_l));

    float p_spec = specularProbability(m);
    float pdf = (1.0 - p_spec) * n_dot_l / M_PI + p_spec * d * n_dot_h / (4.0 * v_dot_h);
    return vec4(diffuse + specular, pdf);
}

vec3 evalBsdf(SurfaceMaterial m, vec3 wo, vec3 wi, vec3 n) {
    return evalReflection(m, wo, wi, n).xyz * (1.0 - m.specular_transmission);
}

struct BsdfSample {
    bool valid;
    vec3 direction;
    vec3 value;
    float pdf;
};

BsdfSample sampleDielectric(SurfaceMaterial m, vec3 wo, vec3 n) {
    BsdfSample s = BsdfSample(false, vec3(0.0), vec3(0.0), 0.0);
    float eta = 1.0 / m.ior;
    if(dot(wo, n) <= 0.0) {
        n = -n;
        eta = m.ior;
    }
    float fresnel = fresnelDielectric(dot(wo, n), eta);
    float weight = m.specular_transmission;

    if(nextFloat() < fresnel) {
        s.direction = reflectAbout(wo, n);
        float cos_o = max(abs(dot(s.direction, n)), 1e-6);
        s.value = vec3(weight * fresnel / cos_o);
        s.pdf = weight * fresnel;
        s.valid = true;
    } else {
        vec3 wi;
        if(!refractAbout(wo, n, eta, wi)) {
            return s;
        }
        float cos_o = max(abs(dot(wi, n)), 1e-6);
        s.direction = wi;
        s.pdf = weight * (1.0 - fresnel);
        s.value = m.base_color * (s.pdf / cos_o);
        s.valid = s.pdf > 0.0;
    }
    return s;
}

BsdfSample sampleBsdf(SurfaceMaterial m, vec3 wo, vec3 n) {
    float transmission = m.specular_transmission;
    if(transmission > 0.0 && nextFloat() < transmission) {
        return sampleDielectric(m, wo, n);
    }

    float p_spec = specularProbability(m);
    float u1 = nextFloat();
    float u2 = nextFloat();
    vec3 direction;
    if(nextFloat() < p_spec) {
        float alpha = materialAlpha(m);
        float a2 = alpha * alpha;
        float cos_theta = sqrt(clamp((1.0 - u1) / (u1 * (a2 - 1.0) + 1.0), 0.0, 1.0));
        float sin_theta = sqrt(max(0.0, 1.0 - cos_theta * cos_theta));
        float phi = 2.0 * M_PI * u2;
        vec3 h = localToWorld(vec3(sin_theta * cos(phi), sin_theta * sin(phi), cos_theta), n);
        direction = reflectAbout(wo, h);
    } else {
        direction = localToWorld(cosineSampleHemisphere(u1, u2), n);
    }

    vec4 f_pdf = evalReflection(m, wo, direction, n);
    float pdf = f_pdf.w * (1.0 - transmission);
    return BsdfSample(pdf > 0.0, direction, f_pdf.xyz * (1.0 - transmission), pdf);
}

// ---- lights ----

vec2 directionToUv(vec3 d) {
    float u = 0.5 + atan(d.z, d.x) / (2.0 * M_PI);
    float v = acos(clamp(d.y, -1.0, 1.0)) / M_PI;
    return vec2(u, v);
}

vec3 uvToDirection(vec2 uv) {
    float phi = (uv.x - 0.5) * 2.0 * M_PI;
    float theta = uv.y * M_PI;
    float sin_theta = sin(theta);
    return vec3(sin_theta * cos(phi), cos(theta), sin_theta * sin(phi));
}

bool hasEnvironment() {
    return params.envmap_width > 0 && params.envmap_height > 0;
}

vec3 envmapLookup(vec3 direction) {
    return textureLod(envmap, directionToUv(direction), 0.0).rgb;
}

bool samplesEnvironment() {
    return ENVMAP_SAMPLING_STRATEGY == 1
        && params.ambient_light_type == AMBIENT_ENVMAP
        && hasEnvironment();
}

vec3 missRadiance(vec3 direction, uint bounce) {
    if(params.ambient_light_type == AMBIENT_UNIFORM) {
        return params.uniform_light_color;
    }
    if(params.ambient_light_type != AMBIENT_ENVMAP || !hasEnvironment()) {
        return vec3(0.0);
    }
    if(bounce > 0 && samplesEnvironment()) {
        return vec3(0.0);
    }
    float scale = (bounce == 0 && params.envmap_scale_background_intensity == 0) ? 1.0 : params.envmap_intensity;
    return envmapLookup(direction) * scale;
}

vec3 sampleOneLight(Surface surface, vec3 wo) {
#if DIRECT_LIGHT_SAMPLING_STRATEGY == 1
    uint count = params.emissive_triangle_count;
    if(count == 0) {
        return vec3(0.0);
    }
    uint pick = min(uint(nextFloat() * float(count)), count - 1u);
    uint light_triangle = emissive_triangle_indices[pick];
    vec3[3] tri = triangleVertices(light_triangle);
    float u1 = nextFloat();
    float u2 = nextFloat();
    vec3 point = uniformTrianglePoint(tri, u1, u2);

    vec3 c = cross(tri[1] - tri[0], tri[2] - tri[0]);
    float area = 0.5 * length(c);
    if(area <= 0.0) {
        return vec3(0.0);
    }
    vec3 light_normal = c / (2.0 * area);

    vec3 to_light = point - surface.position;
    float dist_squared = dot(to_light, to_light);
    if(dist_squared <= 0.0) {
        return vec3(0.0);
    }
    vec3 wi = to_light / sqrt(dist_squared);

    float cos_surface = dot(wi, surface.shading_normal);
    float cos_light = abs(dot(light_normal, wi));
    if(cos_surface <= 0.0 || cos_light <= 1e-6) {
        return vec3(0.0);
    }
    vec3 f = evalBsdf(surface.material, wo, wi, surface.shading_normal);
    if(f == vec3(0.0) || occluded(spawnOrigin(surface, wi), point)) {
        return vec3(0.0);
    }

    vec3 emission = materials[material_indices[light_triangle]].emission;
    float pdf = dist_squared / (cos_light * area * float(count));
    return f * emission * (cos_surface / pdf);
#else
    return vec3(0.0);
#endif
}

vec3 sampleEnvironmentMap(Surface surface, vec3 wo) {
#if ENVMAP_SAMPLING_STRATEGY == 1
    if(!samplesEnvironment()) {
        return vec3(0.0);
    }
    uint n = params.envmap_width * params.envmap_height;
    float total = envmap_cdf[n - 1];
    if(total <= 0.0) {
        return vec3(0.0);
    }
    float target = nextFloat() * total;
    uint lo = 0;
    uint hi = n;
    while(lo < hi) {
        uint mid = (lo + hi) / 2;
        if(envmap_cdf[mid] <= target) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    uint idx = min(lo, n - 1);
    float weight = envmap_cdf[idx] - (idx == 0 ? 0.0 : envmap_cdf[idx - 1]);

    uint x = idx % params.envmap_width;
    uint y = idx / params.envmap_width;
    vec2 uv = vec2(
        (float(x) + nextFloat()) / float(params.envmap_width),
        (float(y) + nextFloat()) / float(params.envmap_height)
    );
    float sin_theta = sin(uv.y * M_PI);
    if(sin_theta <= 0.0 || weight <= 0.0) {
        return vec3(0.0);
    }
    float pdf = weight / total * float(n) / (2.0 * M_PI * M_PI * sin_theta);
    vec3 wi = uvToDirection(uv);

    float cos_surface = dot(wi, surface.shading_normal);
    if(cos_surface <= 0.0 || pdf <= 0.0) {
        return vec3(0.0);
    }
    vec3 f = evalBsdf(surface.material, wo, wi, surface.shading_normal);
    if(f == vec3(0.0) || anyHit(spawnOrigin(surface, wi), wi, T_MAX)) {
        return vec3(0.0);
    }
    return f * envmapLookup(wi) * params.envmap_intensity * (cos_surface / pdf);
#else
    return vec3(0.0);
#endif
}

// ---- path ----

struct PathSample {
    vec3 radiance;
    vec3 normal;
    vec3 albedo;
};

PathSample traceSample(uvec2 pixel) {
    vec2 p = vec2(pixel) + vec2(nextFloat(), nextFloat());
    vec2 ndc = vec2(2.0 * p.x / float(params.width) - 1.0, 1.0 - 2.0 * p.y / float(params.height));
    vec4 near = camera.inverse_projection * vec4(ndc, -1.0, 1.0);
    vec4 far = camera.inverse_projection * vec4(ndc, 1.0, 1.0);
    vec3 direction = normalize((camera.inverse_view * vec4(far.xyz / far.w - near.xyz / near.w, 0.0)).xyz);
    vec3 origin = camera.position;

    PathSample sample_out = PathSample(vec3(0.0), vec3(0.0), vec3(0.0));
    vec3 throughput = vec3(1.0);

    for(uint bounce = 0; bounce < params.max_bounces; bounce++) {
        Hit hit = closestHit(origin, direction);
        if(!hit.hit) {
            sample_out.radiance += throughput * missRadiance(direction, bounce);
            break;
        }
        Surface surface = resolveHit(origin, direction, hit);
        vec3 wo = -direction;

        bool transmissive = surface.material.specular_transmission > 0.0 && !isEmissive(surface.material);
        if(!transmissive && dot(surface.geometric_normal, wo) < 0.0) {
            surface.geometric_normal = -surface.geometric_normal;
            surface.shading_normal = -surface.shading_normal;
        }

        if(bounce == 0) {
            sample_out.normal = surface.shading_normal;
            sample_out.albedo = surface.material.base_color;
        }

        if(bounce == 0 || DIRECT_LIGHT_SAMPLING_STRATEGY == 0) {
            sample_out.radiance += throughput * surface.material.emission;
        }

        vec3 direct = sampleOneLight(surface, wo) + sampleEnvironmentMap(surface, wo);
        sample_out.radiance += throughput * direct;

        BsdfSample scattered = sampleBsdf(surface.material, wo, surface.shading_normal);
        if(!scattered.valid) {
            break;
        }
        float cos_o = abs(dot(scattered.direction, surface.shading_normal));
        throughput *= scattered.value * (cos_o / scattered.pdf);

        origin = spawnOrigin(surface, scattered.direction);
        direction = scattered.direction;
    }
    return sample_out;
}

// ---- convergence ----

#define ACTIVE 0u
#define BELOW_NOISE_STOP 1u
#define STOPPED 2u

bool isBelowNoise(float mean, float sq, uint count, float threshold) {
    float n = float(count);
    float variance = max(0.0, sq / n - mean * mean);
    float interval = 1.96 * sqrt(variance / n);
    return interval <= threshold * mean;
}

uint convergence(uint idx) {
    bool adaptive = params.has_adaptive_buffers != 0;
    uint pixel_samples = adaptive ? sample_counts[idx] : params.sample_number;
    if(params.max_samples > 0 && pixel_samples >= params.max_samples) {
        return STOPPED;
    }
    if(!adaptive) {
        return ACTIVE;
    }
    uint count = sample_counts[idx];
    if(params.sample_number == 0 || count == 0 || count < params.adaptive_sampling_min_samples) {
        return ACTIVE;
    }
    float sq = squared_luminance[idx];
    float mean = luminance(color[idx]) / float(params.sample_number);
    if(params.enable_adaptive_sampling != 0
        && isBelowNoise(mean, sq, count, params.adaptive_sampling_noise_threshold)) {
        return STOPPED;
    }
    if(params.enable_noise_stop != 0 && isBelowNoise(mean, sq, count, params.noise_stop_threshold)) {
        return BELOW_NOISE_STOP;
    }
    return ACTIVE;
}

bool isValid(vec3 radiance) {
    return !any(isnan(radiance)) && !any(isinf(radiance)) && all(greaterThanEqual(radiance, vec3(0.0)));
}

void main() {
    uvec2 pixel = gl_GlobalInvocationID.xy;
    if(pixel.x >= params.width || pixel.y >= params.height) {
        return;
    }
    if(params.render_low_resolution != 0) {
        uint block = max(params.low_resolution_scaling, 1u);
        if(pixel.x % block != 0 || pixel.y % block != 0) {
            return;
        }
    }

    uint idx = pixel.y * params.width + pixel.x;
    bool adaptive = params.has_adaptive_buffers != 0;
    uint sample_number = params.sample_number;
    uint samples_per_frame = params.samples_per_frame;

    if(sample_number == 0) {
        color[idx] = vec3(0.0);
        aov_normal[idx] = vec3(0.0);
        aov_albedo[idx] = vec3(0.0);
        if(adaptive) {
            sample_counts[idx] = 0u;
            squared_luminance[idx] = 0.0;
        }
    }

    uint state = convergence(idx);
    if(state == STOPPED) {
        atomicAdd(pixel_converged_count, 1u);
        if(sample_number > 0) {
            color[idx] *= float(sample_number + samples_per_frame) / float(sample_number);
        }
        return;
    }
    if(state == BELOW_NOISE_STOP) {
        atomicAdd(pixel_converged_count, 1u);
    }

    rng_state = pixelSeed(idx);
    if(rng_state == 0) {
        rng_state = 0x6d2b79f5u;
    }

    vec3 radiance_sum = vec3(0.0);
    vec3 normal_sum = vec3(0.0);
    vec3 albedo_sum = vec3(0.0);
    float squared_luminance_sum = 0.0;
    for(uint s = 0; s < samples_per_frame; s++) {
        PathSample path = traceSample(pixel);
        if(!isValid(path.radiance)) {
            atomicAdd(invalid_sample_count, 1u);
            if(params.display_nans != 0) {
                color[idx] = NAN_DEBUG_COLOR * float(max(sample_number + samples_per_frame, 1u));
            }
            return;
        }
        float lum = luminance(path.radiance);
        squared_luminance_sum += lum * lum;
        radiance_sum += path.radiance;
        normal_sum += path.normal;
        albedo_sum += path.albedo;
    }

    atomicOr(still_one_ray_active, 1u);

    if(adaptive) {
        sample_counts[idx] += samples_per_frame;
        squared_luminance[idx] += squared_luminance_sum;
    }
    color[idx] += radiance_sum;

    if(samples_per_frame > 0) {
        float frames = float(params.frame_number);
        float spf = float(samples_per_frame);
        vec3 new_normal = (aov_normal[idx] * frames + normal_sum / spf) / (frames + 1.0);
        if(dot(new_normal, new_normal) > 1e-24) {
            new_normal = normalize(new_normal);
        }
        aov_normal[idx] = new_normal;
        aov_albedo[idx] = (aov_albedo[idx] * frames + albedo_sum / spf) / (frames + 1.0);
    }
}
";
