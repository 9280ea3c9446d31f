//! C ABI for linking meshcall-core as a static library from mobile hosts that render or scan
//! out-of-band codes (QR, manual entry). Kinds are 0 = offer, 1 = answer.

use std::os::raw::c_int;
use std::slice;

use crate::codec::CompactCodec;
use crate::media::SdpKind;
use crate::protocol::PROTOCOL_VERSION;

/// Returns the current protocol version. Used so the staticlib exports a C symbol and is linkable.
#[no_mangle]
pub extern "C" fn meshcall_core_version() -> u8 {
    PROTOCOL_VERSION
}

fn kind_from_c(kind: c_int) -> Option<SdpKind> {
    match kind {
        0 => Some(SdpKind::Offer),
        1 => Some(SdpKind::Answer),
        _ => None,
    }
}

fn kind_to_c(kind: SdpKind) -> c_int {
    match kind {
        SdpKind::Offer => 0,
        SdpKind::Answer => 1,
    }
}

/// Copy `bytes` into the caller's buffer. Returns bytes written, or -1 if it does not fit.
fn write_out(bytes: &[u8], out_buf: *mut u8, out_buf_len: usize) -> c_int {
    if bytes.len() > out_buf_len || bytes.len() > c_int::MAX as usize {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
    }
    bytes.len() as c_int
}

/// Encode an SDP (UTF-8, not NUL-terminated) into an out-of-band code. Returns bytes written
/// to out_buf (ASCII, not NUL-terminated), or -1 on bad arguments or a too-small buffer.
#[no_mangle]
pub extern "C" fn meshcall_code_encode(
    kind: c_int,
    sdp: *const u8,
    sdp_len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if sdp.is_null() || out_buf.is_null() {
        return -1;
    }
    let Some(kind) = kind_from_c(kind) else {
        return -1;
    };
    let bytes = unsafe { slice::from_raw_parts(sdp, sdp_len) };
    let Ok(text) = std::str::from_utf8(bytes) else {
        return -1;
    };
    let code = CompactCodec::default().encode(kind, text);
    write_out(code.as_bytes(), out_buf, out_buf_len)
}

/// Decode an out-of-band code. Fills out_kind and writes the SDP to out_buf. Returns bytes
/// written, or -1 if the code is invalid or the buffer too small.
#[no_mangle]
pub extern "C" fn meshcall_code_decode(
    code: *const u8,
    code_len: usize,
    out_kind: *mut c_int,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if code.is_null() || out_kind.is_null() || out_buf.is_null() {
        return -1;
    }
    let bytes = unsafe { slice::from_raw_parts(code, code_len) };
    let Ok(text) = std::str::from_utf8(bytes) else {
        return -1;
    };
    let decoded = match CompactCodec::default().decode(text) {
        Ok(d) => d,
        Err(_) => return -1,
    };
    let written = write_out(decoded.sdp.as_bytes(), out_buf, out_buf_len);
    if written >= 0 {
        unsafe {
            *out_kind = kind_to_c(decoded.kind);
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_through_the_c_surface() {
        let sdp = b"v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
        let mut code = [0u8; 512];
        let n = meshcall_code_encode(1, sdp.as_ptr(), sdp.len(), code.as_mut_ptr(), code.len());
        assert!(n > 0);

        let mut kind: c_int = -1;
        let mut out = [0u8; 512];
        let m = meshcall_code_decode(code.as_ptr(), n as usize, &mut kind, out.as_mut_ptr(), out.len());
        assert_eq!(kind, 1);
        assert_eq!(&out[..m as usize], sdp);
    }

    #[test]
    fn bad_arguments_return_minus_one() {
        let mut out = [0u8; 4];
        let sdp = b"v=0\r\n";
        assert_eq!(meshcall_code_encode(7, sdp.as_ptr(), sdp.len(), out.as_mut_ptr(), out.len()), -1);
        assert_eq!(meshcall_code_encode(0, sdp.as_ptr(), sdp.len(), out.as_mut_ptr(), out.len()), -1);
        let mut kind: c_int = 0;
        let junk = b"!!";
        assert_eq!(
            meshcall_code_decode(junk.as_ptr(), junk.len(), &mut kind, out.as_mut_ptr(), out.len()),
            -1
        );
        assert_eq!(meshcall_core_version(), PROTOCOL_VERSION);
    }
}
