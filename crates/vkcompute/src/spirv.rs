//! SPIR-V inspection.
//!
//! Just enough of the binary format to reject garbage before it reaches the
//! driver and to recover the entry points and workgroup sizes a compute
//! module declares. This is not a validator in the `spirv-val` sense.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::{ComputeError, Result};

/// SPIR-V magic number (first word of every SPIR-V binary).
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Header length in words.
const HEADER_WORDS: usize = 5;

const OP_ENTRY_POINT: u16 = 15;
const OP_EXECUTION_MODE: u16 = 16;
const OP_CAPABILITY: u16 = 17;
const OP_CONSTANT: u16 = 43;
const OP_CONSTANT_COMPOSITE: u16 = 44;
const OP_SPEC_CONSTANT: u16 = 50;
const OP_SPEC_CONSTANT_COMPOSITE: u16 = 51;
const OP_DECORATE: u16 = 71;
const OP_EXECUTION_MODE_ID: u16 = 331;

/// `ExecutionModel::GLCompute`.
pub const EXECUTION_MODEL_GL_COMPUTE: u32 = 5;
const EXECUTION_MODE_LOCAL_SIZE: u32 = 17;
const EXECUTION_MODE_LOCAL_SIZE_ID: u32 = 38;
const DECORATION_BUILT_IN: u32 = 11;
const BUILT_IN_WORKGROUP_SIZE: u32 = 25;

/// An entry point declared by `OpEntryPoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: String,
    pub execution_model: u32,
    /// Result id of the entry function.
    pub function_id: u32,
    /// Workgroup size, if the module declares one that resolves to
    /// non-zero constants.
    ///
    /// A `BuiltIn WorkgroupSize` constant takes precedence over the execution
    /// mode, as it does on the device. Specialization constants resolve to
    /// their defaults.
    pub local_size: Option<[u32; 3]>,
}

impl EntryPoint {
    pub fn is_compute(&self) -> bool {
        self.execution_model == EXECUTION_MODEL_GL_COMPUTE
    }

    /// Invocations along x, the only axis this crate dispatches over.
    pub fn workgroup_size_x(&self) -> Option<u32> {
        self.local_size.map(|[x, _, _]| x)
    }

    /// The resolved workgroup size, or `ShaderLoad` when the module leaves
    /// it unknown.
    pub fn workgroup_size(&self) -> Result<[u32; 3]> {
        self.local_size.ok_or_else(|| {
            ComputeError::shader(format!(
                "entry point {:?} declares no workgroup size that resolves to constants",
                self.name
            ))
        })
    }
}

/// A header-checked SPIR-V module with its entry points indexed.
#[derive(Debug, Clone)]
pub struct SpirvModule {
    words: Vec<u32>,
    version: (u8, u8),
    capabilities: Vec<u32>,
    entry_points: Vec<EntryPoint>,
}

impl SpirvModule {
    /// Parse raw bytes. Little-endian and byte-swapped modules are accepted.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(ComputeError::shader(format!(
                "SPIR-V length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let mut words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if words.first() == Some(&SPIRV_MAGIC.swap_bytes()) {
            for w in &mut words {
                *w = w.swap_bytes();
            }
        }
        Self::from_words(words)
    }

    /// Parse a module already split into host-order words.
    pub fn from_words(words: impl Into<Vec<u32>>) -> Result<Self> {
        let words = words.into();
        if words.len() < HEADER_WORDS {
            return Err(ComputeError::shader(format!(
                "SPIR-V binary too short: {} bytes (minimum 20)",
                words.len() * 4
            )));
        }
        if words[0] != SPIRV_MAGIC {
            return Err(ComputeError::shader(format!(
                "bad magic: expected 0x{SPIRV_MAGIC:08X}, got 0x{:08X}",
                words[0]
            )));
        }
        // Major in bits 23:16, minor in bits 15:8.
        let major = ((words[1] >> 16) & 0xFF) as u8;
        let minor = ((words[1] >> 8) & 0xFF) as u8;
        if major != 1 || minor > 6 {
            return Err(ComputeError::shader(format!("unsupported SPIR-V version {major}.{minor}")));
        }

        let mut capabilities = Vec::new();
        let mut entry_points = Vec::new();
        let mut local_sizes: Vec<(u32, [u32; 3])> = Vec::new();
        let mut local_size_ids: Vec<(u32, Vec<u32>)> = Vec::new();
        let mut scalars: HashMap<u32, u32> = HashMap::new();
        let mut composites: HashMap<u32, Vec<u32>> = HashMap::new();
        let mut workgroup_size_builtin = None;

        let mut offset = HEADER_WORDS;
        while offset < words.len() {
            let word_count = (words[offset] >> 16) as usize;
            let opcode = (words[offset] & 0xFFFF) as u16;
            if word_count == 0 || offset + word_count > words.len() {
                return Err(ComputeError::shader(format!(
                    "truncated instruction at word {offset} (opcode {opcode}, {word_count} words)"
                )));
            }
            let operands = &words[offset + 1..offset + word_count];
            match opcode {
                OP_CAPABILITY => capabilities.extend(operands.first().copied()),
                OP_ENTRY_POINT if operands.len() >= 3 => {
                    let name = decode_literal_string(&operands[2..]).ok_or_else(|| {
                        ComputeError::shader(format!(
                            "unterminated entry point name at word {offset}"
                        ))
                    })?;
                    entry_points.push(EntryPoint {
                        name,
                        execution_model: operands[0],
                        function_id: operands[1],
                        local_size: None,
                    });
                }
                OP_EXECUTION_MODE
                    if operands.len() >= 5 && operands[1] == EXECUTION_MODE_LOCAL_SIZE =>
                {
                    local_sizes.push((operands[0], [operands[2], operands[3], operands[4]]));
                }
                OP_EXECUTION_MODE_ID
                    if operands.len() >= 2 && operands[1] == EXECUTION_MODE_LOCAL_SIZE_ID =>
                {
                    local_size_ids.push((operands[0], operands[2..].to_vec()));
                }
                OP_DECORATE
                    if operands.len() >= 3
                        && operands[1] == DECORATION_BUILT_IN
                        && operands[2] == BUILT_IN_WORKGROUP_SIZE =>
                {
                    workgroup_size_builtin = Some(operands[0]);
                }
                // Result type, result id, then the low word of the value.
                OP_CONSTANT | OP_SPEC_CONSTANT if operands.len() >= 3 => {
                    scalars.insert(operands[1], operands[2]);
                }
                OP_CONSTANT_COMPOSITE | OP_SPEC_CONSTANT_COMPOSITE if operands.len() >= 2 => {
                    composites.insert(operands[1], operands[2..].to_vec());
                }
                _ => {}
            }
            offset += word_count;
        }

        let resolve = |ids: &[u32]| -> Option<[u32; 3]> {
            let [x, y, z] = ids else { return None };
            let size = [*scalars.get(x)?, *scalars.get(y)?, *scalars.get(z)?];
            size.iter().all(|&d| d > 0).then_some(size)
        };
        // Applies to every entry point in the module; unresolvable means
        // unknown, never the execution mode it overrides.
        let builtin_size =
            workgroup_size_builtin.map(|id| composites.get(&id).and_then(|ids| resolve(ids)));

        for ep in &mut entry_points {
            ep.local_size = match builtin_size {
                Some(size) => size,
                None => local_sizes
                    .iter()
                    .find(|(id, _)| *id == ep.function_id)
                    .map(|(_, size)| *size)
                    .filter(|size| size.iter().all(|&d| d > 0))
                    .or_else(|| {
                        local_size_ids
                            .iter()
                            .find(|(id, _)| *id == ep.function_id)
                            .and_then(|(_, ids)| resolve(ids))
                    }),
            };
        }

        debug!(
            version = %format_args!("{major}.{minor}"),
            words = words.len(),
            entry_points = entry_points.len(),
            "parsed SPIR-V module"
        );

        Ok(Self { words, version: (major, minor), capabilities, entry_points })
    }

    /// Read and parse a `.spv` file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| ComputeError::shader(format!("failed to read {}: {e}", path.display())))?;
        Self::parse(&bytes)
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// `(major, minor)` from the header.
    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    pub fn has_capability(&self, capability: u32) -> bool {
        self.capabilities.contains(&capability)
    }

    /// The `GLCompute` entry point called `name`.
    pub fn compute_entry_point(&self, name: &str) -> Result<&EntryPoint> {
        self.entry_points.iter().find(|ep| ep.is_compute() && ep.name == name).ok_or_else(|| {
            let declared: Vec<&str> = self.entry_points.iter().map(|ep| ep.name.as_str()).collect();
            ComputeError::shader(format!(
                "no GLCompute entry point named {name:?} (declared: {declared:?})"
            ))
        })
    }
}

/// Decode a nul-terminated UTF-8 literal packed four bytes per word.
fn decode_literal_string(words: &[u32]) -> Option<String> {
    let mut bytes = Vec::new();
    for word in words {
        for b in word.to_le_bytes() {
            if b == 0 {
                return String::from_utf8(bytes).ok();
            }
            bytes.push(b);
        }
    }
    None
}

/// Build a minimal header-only SPIR-V binary for testing.
#[cfg(test)]
pub(crate) fn build_test_spirv(version_major: u8, version_minor: u8) -> Vec<u8> {
    let version_word = (u32::from(version_major) << 16) | (u32::from(version_minor) << 8);
    [SPIRV_MAGIC, version_word, 0, 1, 0].iter().flat_map(|w| w.to_le_bytes()).collect()
}
