// Copyright 2025 Fleetctl Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! UUID canonicalization (spec §9).
//!
//! Some virtualization paths (notably the SMBIOS system UUID that
//! hypervisors hand to guests) deliver the first three hyphen groups of
//! a UUID byte-swapped relative to how the VM registry stored them.
//! Handshake lookups must try both the raw and the "unmangled" form and
//! use whichever one hits, consistently, from then on.

/// Lowercase a UUID string for use as a registry key/filename component.
pub fn canonicalize(uuid: &str) -> String {
    uuid.to_lowercase()
}

/// Reverse the byte order within the first three hyphen-delimited groups
/// of a UUID (the `time_low`, `time_mid`, and `time_hi_and_version`
/// fields), leaving the clock-sequence and node groups untouched. This
/// undoes the little/big-endian mismatch some hypervisors introduce.
/// Returns `None` if `uuid` isn't shaped like a UUID (wrong group count
/// or odd-length group).
pub fn unmangle(uuid: &str) -> Option<String> {
    let groups: Vec<&str> = uuid.split('-').collect();
    if groups.len() != 5 {
        return None;
    }
    if groups[0].len() != 8 || groups[1].len() != 4 || groups[2].len() != 4 {
        return None;
    }

    let mut out = String::with_capacity(uuid.len());
    out.push_str(&reverse_bytes(groups[0])?);
    out.push('-');
    out.push_str(&reverse_bytes(groups[1])?);
    out.push('-');
    out.push_str(&reverse_bytes(groups[2])?);
    out.push('-');
    out.push_str(groups[3]);
    out.push('-');
    out.push_str(groups[4]);
    Some(out.to_lowercase())
}

fn reverse_bytes(hex_group: &str) -> Option<String> {
    if hex_group.len() % 2 != 0 {
        return None;
    }
    let bytes: Vec<&str> = hex_group.as_bytes().chunks(2).map(|c| std::str::from_utf8(c).ok()).collect::<Option<_>>()?;
    Some(bytes.into_iter().rev().collect::<Vec<_>>().join(""))
}
