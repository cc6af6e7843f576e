//! Wire protocol shared between the host router and the enclaves:
//! length-prefixed JSON framing plus the request/response payload types.

mod frame;
mod types;

pub use frame::{read_frame, write_frame, FrameError, MAX_FRAME_LEN};
pub use types::{
    AttestationDoc, EnclaveRequest, EnclaveResponse, Headers, PcrValues, ENCLAVE_PORT,
};
