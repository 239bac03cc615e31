//! Raw machine code: staging, W^X loading and direct execution.
//!
//! ```text
//! hex text --decode--> bytes --allocate RW--> copy --protect RX + flush--> ExecutableBlock
//! ```
//!
//! Any failure along the pipeline releases what was already mapped and
//! records a short diagnostic in the thread's last-error slot.

pub mod region;
pub mod stream;

use std::ffi::{CString, c_char, c_int};

use tracing::{debug, info};

pub use region::{EntryFn, EntryPoint, ExecutableRegion, WritableRegion};
pub use stream::{Instruction, InstructionStream};

use crate::error::{Error, Result, fail};
use crate::hex;

/// Architecture id of the running host, e.g. `"x86_64"` or `"aarch64"`.
pub fn host_arch() -> &'static str {
    std::env::consts::ARCH
}

/// Loaded machine code plus the ids it was assembled for.
///
/// Owns its pages; [`ExecutableBlock::free`] or drop releases them.
#[derive(Debug)]
pub struct ExecutableBlock {
    architecture: String,
    backend: String,
    region: Option<ExecutableRegion>,
}

impl ExecutableBlock {
    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Code size in bytes; `0` once freed.
    pub fn size(&self) -> usize {
        self.region.as_ref().map_or(0, |r| r.len())
    }

    /// True while the block holds sealed read+execute pages.
    pub fn is_executable(&self) -> bool {
        self.region.is_some()
    }

    pub fn code(&self) -> Option<&[u8]> {
        self.region.as_ref().map(|r| r.as_bytes())
    }

    /// Unmap the pages and reset to the empty state. Safe to call twice.
    pub fn free(&mut self) {
        if let Some(region) = self.region.take() {
            debug!("Freeing {} byte block ({})", region.len(), self.architecture);
        }
    }
}

/// `(argc, argv)` handed to executed code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecContext {
    pub args: Vec<String>,
}

impl ExecContext {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Owned C view of an [`ExecContext`]; keeps the strings alive during a call.
struct CArgs {
    _strings: Vec<CString>,
    pointers: Vec<*const c_char>,
}

impl CArgs {
    fn new(ctx: Option<&ExecContext>) -> Result<Self> {
        let mut strings = Vec::new();
        for arg in ctx.map(|c| c.args.as_slice()).unwrap_or_default() {
            match CString::new(arg.as_str()) {
                Ok(s) => strings.push(s),
                Err(_) => {
                    return fail(Error::InvalidArgument(format!(
                        "argument {:?} contains a NUL byte",
                        arg
                    )));
                }
            }
        }
        let mut pointers: Vec<*const c_char> = strings.iter().map(|s| s.as_ptr()).collect();
        pointers.push(std::ptr::null());

        Ok(Self {
            _strings: strings,
            pointers,
        })
    }

    fn argc(&self) -> c_int {
        (self.pointers.len() - 1) as c_int
    }

    fn argv(&self) -> *const *const c_char {
        self.pointers.as_ptr()
    }
}

/// allocate → copy → protect → flush. Shared by block assembly and VM-mode
/// sandboxes.
pub(crate) fn load(code: &[u8]) -> Result<ExecutableRegion> {
    if code.is_empty() {
        return fail(Error::EmptyInput("empty code"));
    }
    let mut region = WritableRegion::allocate(code.len())?;
    region.as_mut_slice().copy_from_slice(code);
    region.make_executable()
}

/// Decode `hex_source` and load it as executable code.
pub fn assemble_text(architecture: &str, backend: &str, hex_source: &str) -> Result<ExecutableBlock> {
    let bytes = hex::decode(hex_source)?;
    let region = load(&bytes)?;
    info!(
        "Loaded {} bytes of {} code via {} backend",
        region.len(),
        architecture,
        backend
    );

    Ok(ExecutableBlock {
        architecture: architecture.to_string(),
        backend: backend.to_string(),
        region: Some(region),
    })
}

/// Mnemonic translation is not available; every stream is rejected.
pub fn assemble_stream(stream: &InstructionStream, backend: &str) -> Result<ExecutableBlock> {
    if stream.is_empty() {
        return fail(Error::EmptyInput("empty instruction stream"));
    }
    debug!(
        "Refusing to assemble {} {} instructions for {} backend",
        stream.len(),
        stream.architecture(),
        backend
    );
    fail(Error::NotImplemented("instruction assembly not implemented"))
}

/// Call the block as `int entry(int argc, char **argv)`.
///
/// `ctx` defaults to `(0, [NULL])`. The block must hold genuine machine code
/// for the host architecture; the checks here only cover the block's state.
pub fn execute(block: &ExecutableBlock, ctx: Option<&ExecContext>) -> Result<i32> {
    let Some(region) = block.region.as_ref() else {
        return fail(Error::InvalidBlock("block has no code or is not executable"));
    };
    if region.is_empty() {
        return fail(Error::InvalidBlock("block is empty"));
    }
    invoke(region, ctx)
}

pub(crate) fn invoke(region: &ExecutableRegion, ctx: Option<&ExecContext>) -> Result<i32> {
    let args = CArgs::new(ctx)?;
    debug!("Executing {} byte region with argc={}", region.len(), args.argc());

    // SAFETY: the region is sealed RX and outlives the call; the code itself
    // is trusted by contract.
    let result = unsafe { region.entry().invoke(args.argc(), args.argv()) };
    Ok(result)
}

/// Hex dump of the block's code, `"B8 2A ... C3 "`.
pub fn dump_hex(block: &ExecutableBlock) -> Result<String> {
    match block.code() {
        Some(code) if !code.is_empty() => Ok(hex::encode(code)),
        _ => fail(Error::InvalidBlock("nothing to dump")),
    }
}
