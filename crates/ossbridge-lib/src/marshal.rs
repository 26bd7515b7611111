//! Ioctl argument staging — the two-phase retry protocol.
//!
//! The kernel's ioctl path carries no size metadata, so argument memory
//! cannot cross the privilege boundary until the driver declares exactly
//! which byte ranges it needs. The first invocation of an ioctl therefore
//! arrives with no buffers staged; the driver answers with the required
//! input/output sizes and the transport re-invokes the ioctl once the data
//! is resident. The second pass must arrive with exactly the declared
//! sizes.

use std::fmt;

/// Argument buffers as currently delivered by the kernel transport.
///
/// `input` is empty on the first pass of a command that takes input;
/// `output_capacity` is zero on the first pass of a command that produces
/// output.
#[derive(Debug, Clone, Copy)]
pub struct IoctlArgs<'a> {
    pub input: &'a [u8],
    pub output_capacity: usize,
}

impl IoctlArgs<'_> {
    /// The first, un-staged pass of an ioctl round-trip.
    pub const UNSTAGED: IoctlArgs<'static> = IoctlArgs {
        input: &[],
        output_capacity: 0,
    };
}

/// Outcome of a staging check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staged {
    /// A required buffer is not resident. The transport must stage the
    /// declared ranges and re-invoke the ioctl; no side effects yet.
    Retry { in_size: usize, out_size: usize },
    /// Both sides resident; `input` is a copy the handler may consume.
    Ready { input: Vec<u8> },
}

/// Staged buffer does not match the declared shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalError {
    InputSize { expected: usize, got: usize },
    OutputCapacity { expected: usize, got: usize },
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::InputSize { expected, got } => {
                write!(f, "staged input size mismatch: expected {expected}, got {got}")
            }
            MarshalError::OutputCapacity { expected, got } => {
                write!(
                    f,
                    "staged output capacity mismatch: expected {expected}, got {got}"
                )
            }
        }
    }
}

impl std::error::Error for MarshalError {}

/// Check residency for an ioctl with the given argument shape.
///
/// `in_size`/`out_size` come from the command's declared argument shape; a
/// zero size means that side carries nothing and is never staged.
pub fn stage(
    in_size: usize,
    out_size: usize,
    args: &IoctlArgs<'_>,
) -> Result<Staged, MarshalError> {
    let need_in_fetch = in_size > 0 && args.input.is_empty();
    let need_out_fetch = out_size > 0 && args.output_capacity == 0;

    if need_in_fetch || need_out_fetch {
        return Ok(Staged::Retry { in_size, out_size });
    }

    if in_size > 0 && args.input.len() != in_size {
        return Err(MarshalError::InputSize {
            expected: in_size,
            got: args.input.len(),
        });
    }
    if out_size > 0 && args.output_capacity != out_size {
        return Err(MarshalError::OutputCapacity {
            expected: out_size,
            got: args.output_capacity,
        });
    }

    Ok(Staged::Ready {
        input: args.input.to_vec(),
    })
}
