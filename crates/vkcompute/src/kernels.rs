//! Embedded compute kernels.
//!
//! The sum kernel is kept as pre-assembled SPIR-V so the crate can run a
//! dispatch without a shader toolchain on the build host. The GLSL it was
//! assembled from lives in `shaders/sum.comp`.

/// GLSL source of [`SUM_KERNEL_WORDS`].
pub const SUM_KERNEL_GLSL: &str = include_str!("../shaders/sum.comp");

/// Entry point name of the sum kernel.
pub const ENTRY_POINT: &str = "main";

/// `local_size_x` of the sum kernel.
pub const WORKGROUP_SIZE: u32 = 64;

/// Descriptor slots the sum kernel reads: 0 is input, 1 is output.
pub const SLOT_COUNT: u32 = 2;

/// `out[i] = in[i] + in[i]` over `int` storage buffers, SPIR-V 1.0.
#[rustfmt::skip]
pub const SUM_KERNEL_WORDS: &[u32] = &[
    // magic, version 1.0, generator, bound, schema
    0x0723_0203, 0x0001_0000, 0x0000_0000, 25, 0,
    // OpCapability Shader
    0x0002_0011, 1,
    // OpMemoryModel Logical GLSL450
    0x0003_000E, 0, 1,
    // OpEntryPoint GLCompute %1 "main" %2
    0x0006_000F, 5, 1, 0x6E69_616D, 0, 2,
    // OpExecutionMode %1 LocalSize 64 1 1
    0x0006_0010, 1, 17, WORKGROUP_SIZE, 1, 1,
    // OpDecorate %2 BuiltIn GlobalInvocationId
    0x0004_0047, 2, 11, 28,
    // OpDecorate %3 ArrayStride 4
    0x0004_0047, 3, 6, 4,
    // OpMemberDecorate %4 0 Offset 0
    0x0005_0048, 4, 0, 35, 0,
    // OpDecorate %4 BufferBlock
    0x0003_0047, 4, 3,
    // OpDecorate %5 DescriptorSet 0 / Binding 0
    0x0004_0047, 5, 34, 0,
    0x0004_0047, 5, 33, 0,
    // OpDecorate %6 DescriptorSet 0 / Binding 1
    0x0004_0047, 6, 34, 0,
    0x0004_0047, 6, 33, 1,
    // %7 = OpTypeVoid
    0x0002_0013, 7,
    // %8 = OpTypeFunction %7
    0x0003_0021, 8, 7,
    // %9 = OpTypeInt 32 0
    0x0004_0015, 9, 32, 0,
    // %10 = OpTypeInt 32 1
    0x0004_0015, 10, 32, 1,
    // %11 = OpTypeVector %9 3
    0x0004_0017, 11, 9, 3,
    // %12 = OpTypePointer Input %11
    0x0004_0020, 12, 1, 11,
    // %2 = OpVariable %12 Input
    0x0004_003B, 12, 2, 1,
    // %13 = OpTypePointer Input %9
    0x0004_0020, 13, 1, 9,
    // %14 = OpConstant %9 0
    0x0004_002B, 9, 14, 0,
    // %15 = OpConstant %10 0
    0x0004_002B, 10, 15, 0,
    // %3 = OpTypeRuntimeArray %10
    0x0003_001D, 3, 10,
    // %4 = OpTypeStruct %3
    0x0003_001E, 4, 3,
    // %16 = OpTypePointer Uniform %4
    0x0004_0020, 16, 2, 4,
    // %5, %6 = OpVariable %16 Uniform
    0x0004_003B, 16, 5, 2,
    0x0004_003B, 16, 6, 2,
    // %17 = OpTypePointer Uniform %10
    0x0004_0020, 17, 2, 10,
    // %1 = OpFunction %7 None %8
    0x0005_0036, 7, 1, 0, 8,
    // %18 = OpLabel
    0x0002_00F8, 18,
    // %19 = OpAccessChain %13 %2 %14
    0x0005_0041, 13, 19, 2, 14,
    // %20 = OpLoad %9 %19
    0x0004_003D, 9, 20, 19,
    // %21 = OpAccessChain %17 %5 %15 %20
    0x0006_0041, 17, 21, 5, 15, 20,
    // %22 = OpLoad %10 %21
    0x0004_003D, 10, 22, 21,
    // %23 = OpIAdd %10 %22 %22
    0x0005_0080, 10, 23, 22, 22,
    // %24 = OpAccessChain %17 %6 %15 %20
    0x0006_0041, 17, 24, 6, 15, 20,
    // OpStore %24 %23
    0x0003_003E, 24, 23,
    // OpReturn
    0x0001_00FD,
    // OpFunctionEnd
    0x0001_0038,
];

/// The sum kernel as little-endian bytes, the layout of a `.spv` file.
pub fn sum_kernel_bytes() -> Vec<u8> {
    SUM_KERNEL_WORDS.iter().flat_map(|w| w.to_le_bytes()).collect()
}
