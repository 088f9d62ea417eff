//! Small-file bin packing
//!
//! First-fit-decreasing over the pack-candidate set: sort by size
//! descending (path as tie-break so runs are deterministic), place each
//! file into the first pack with room, open a new pack when none fits. A
//! file never straddles packs.

/// One candidate for packing.
#[derive(Debug, Clone)]
pub struct PackInput {
    pub file_id: String,
    pub relative_path: String,
    pub size: u64,
}

/// A planned pack: members in placement order with assigned offsets.
#[derive(Debug, Clone)]
pub struct PlannedPack {
    pub members: Vec<PlannedMember>,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct PlannedMember {
    pub file_id: String,
    pub relative_path: String,
    pub offset_in_pack: u64,
    pub length: u64,
}

/// Pack `inputs` into bins of at most `capacity` bytes.
pub fn first_fit_decreasing(mut inputs: Vec<PackInput>, capacity: u64) -> Vec<PlannedPack> {
    inputs.sort_by(|a, b| {
        b.size
            .cmp(&a.size)
            .then_with(|| a.relative_path.cmp(&b.relative_path))
    });

    let mut packs: Vec<PlannedPack> = Vec::new();
    for input in inputs {
        debug_assert!(input.size <= capacity);
        let slot = packs
            .iter_mut()
            .find(|pack| pack.total + input.size <= capacity);
        let pack = match slot {
            Some(pack) => pack,
            None => {
                packs.push(PlannedPack {
                    members: Vec::new(),
                    total: 0,
                });
                packs.last_mut().expect("just pushed")
            }
        };
        pack.members.push(PlannedMember {
            file_id: input.file_id,
            relative_path: input.relative_path,
            offset_in_pack: pack.total,
            length: input.size,
        });
        pack.total += input.size;
    }
    packs
}
