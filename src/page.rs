//! Page arithmetic for protection changes

/// Page-aligned span covering `[address, address + len)`.
///
/// Returns the start of the first page and the number of bytes from there to the end of the
/// range. The kernel rounds the end up to a page boundary itself.
pub fn span(address: usize, len: usize, page_size: usize) -> (usize, usize) {
    debug_assert!(page_size.is_power_of_two());
    let start = address & !(page_size - 1);
    (start, address + len - start)
}
