//! H.264 Annex B helpers.

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;

/// Iterate the NAL units of an Annex B byte stream, start codes stripped.
pub fn nal_units(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            starts.push((i, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let bounds: Vec<(usize, usize)> = starts
        .iter()
        .enumerate()
        .map(|(idx, &(_, payload))| {
            let end = match starts.get(idx + 1) {
                // A 4-byte start code is a zero byte followed by a 3-byte one
                Some(&(code, _)) if code > 0 && data[code - 1] == 0 => code - 1,
                Some(&(code, _)) => code,
                None => data.len(),
            };
            (payload, end.max(payload))
        })
        .collect();

    bounds
        .into_iter()
        .map(move |(start, end)| &data[start..end])
        .filter(|nal| !nal.is_empty())
}

/// `nal_unit_type` of a NAL unit (low 5 bits of the header byte).
pub fn nal_type(nal: &[u8]) -> Option<u8> {
    nal.first().map(|b| b & 0x1F)
}

/// True if the access unit contains an IDR slice.
pub fn contains_idr(data: &[u8]) -> bool {
    nal_units(data).any(|nal| nal_type(nal) == Some(NAL_IDR))
}
