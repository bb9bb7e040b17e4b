//! Image layout transition table.
//!
//! Every layout the renderer tracks has one row: the pipeline stages and
//! accesses that must complete before leaving it (source scope), and the ones
//! that must wait before entering it (destination scope). A transition
//! `old -> new` pairs the source scope of `old` with the destination scope of
//! `new`, so adding a layout means adding a single row.

use ash::vk;

/// Pipeline stages plus access mask on one side of a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessScope {
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

impl AccessScope {
    const fn new(stages: vk::PipelineStageFlags, access: vk::AccessFlags) -> Self {
        Self { stages, access }
    }
}

/// Both halves of a layout transition barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src: AccessScope,
    pub dst: AccessScope,
}

struct LayoutRow {
    layout: vk::ImageLayout,
    /// `None` when the layout may not be transitioned away from.
    src: Option<AccessScope>,
    /// `None` when the layout may not be transitioned into.
    dst: Option<AccessScope>,
}

const DEPTH_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS.as_raw()
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS.as_raw(),
);

const SAMPLED_STAGES: vk::PipelineStageFlags = vk::PipelineStageFlags::from_raw(
    vk::PipelineStageFlags::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags::COMPUTE_SHADER.as_raw(),
);

const fn stages(a: vk::PipelineStageFlags, b: vk::PipelineStageFlags) -> vk::PipelineStageFlags {
    vk::PipelineStageFlags::from_raw(a.as_raw() | b.as_raw())
}

const fn access(a: vk::AccessFlags, b: vk::AccessFlags) -> vk::AccessFlags {
    vk::AccessFlags::from_raw(a.as_raw() | b.as_raw())
}

const TABLE: &[LayoutRow] = &[
    LayoutRow {
        layout: vk::ImageLayout::UNDEFINED,
        src: Some(AccessScope::new(
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::NONE,
        )),
        dst: None,
    },
    LayoutRow {
        layout: vk::ImageLayout::GENERAL,
        src: Some(AccessScope::new(
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_WRITE,
        )),
        dst: Some(AccessScope::new(
            vk::PipelineStageFlags::ALL_COMMANDS,
            access(vk::AccessFlags::MEMORY_READ, vk::AccessFlags::MEMORY_WRITE),
        )),
    },
    LayoutRow {
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        src: Some(AccessScope::new(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )),
        dst: Some(AccessScope::new(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            access(
                vk::AccessFlags::COLOR_ATTACHMENT_READ,
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            ),
        )),
    },
    LayoutRow {
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        src: Some(AccessScope::new(
            DEPTH_STAGES,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )),
        dst: Some(AccessScope::new(
            DEPTH_STAGES,
            access(
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
        )),
    },
    LayoutRow {
        layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        src: Some(AccessScope::new(
            stages(DEPTH_STAGES, SAMPLED_STAGES),
            vk::AccessFlags::NONE,
        )),
        dst: Some(AccessScope::new(
            stages(DEPTH_STAGES, SAMPLED_STAGES),
            access(
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
                vk::AccessFlags::SHADER_READ,
            ),
        )),
    },
    LayoutRow {
        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        src: Some(AccessScope::new(SAMPLED_STAGES, vk::AccessFlags::NONE)),
        dst: Some(AccessScope::new(
            SAMPLED_STAGES,
            access(
                vk::AccessFlags::SHADER_READ,
                vk::AccessFlags::INPUT_ATTACHMENT_READ,
            ),
        )),
    },
    LayoutRow {
        layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        src: Some(AccessScope::new(
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::NONE,
        )),
        dst: Some(AccessScope::new(
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        )),
    },
    LayoutRow {
        layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        src: Some(AccessScope::new(
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        )),
        dst: Some(AccessScope::new(
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        )),
    },
    LayoutRow {
        layout: vk::ImageLayout::PREINITIALIZED,
        src: Some(AccessScope::new(
            vk::PipelineStageFlags::HOST,
            vk::AccessFlags::HOST_WRITE,
        )),
        dst: None,
    },
    // Acquire and present perform their own visibility operations.
    LayoutRow {
        layout: vk::ImageLayout::PRESENT_SRC_KHR,
        src: Some(AccessScope::new(
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::NONE,
        )),
        dst: Some(AccessScope::new(
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::NONE,
        )),
    },
];

fn row(layout: vk::ImageLayout) -> Option<&'static LayoutRow> {
    TABLE.iter().find(|row| row.layout == layout)
}

/// Every layout with a row in the transition table.
pub fn tracked_layouts() -> impl Iterator<Item = vk::ImageLayout> {
    TABLE.iter().map(|row| row.layout)
}

/// Scope that must complete before an image leaves `layout`.
pub fn source_scope(layout: vk::ImageLayout) -> Option<AccessScope> {
    row(layout).and_then(|row| row.src)
}

/// Scope that must wait before an image enters `layout`.
pub fn destination_scope(layout: vk::ImageLayout) -> Option<AccessScope> {
    row(layout).and_then(|row| row.dst)
}

/// Look up the barrier scopes for `old -> new`.
///
/// Returns `None` when either side has no entry, e.g. transitions into
/// `UNDEFINED` or layouts the table does not know.
pub fn lookup(old: vk::ImageLayout, new: vk::ImageLayout) -> Option<LayoutTransition> {
    Some(LayoutTransition {
        old_layout: old,
        new_layout: new,
        src: source_scope(old)?,
        dst: destination_scope(new)?,
    })
}

/// Like [`lookup`], but an unknown pair is a programming error.
pub fn transition(old: vk::ImageLayout, new: vk::ImageLayout) -> LayoutTransition {
    lookup(old, new)
        .unwrap_or_else(|| panic!("Unknown image layout transition {old:?} -> {new:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_pair_resolves_or_is_rejected_by_row() {
        for old in tracked_layouts() {
            for new in tracked_layouts() {
                let expected = source_scope(old).is_some() && destination_scope(new).is_some();
                assert_eq!(lookup(old, new).is_some(), expected, "{old:?} -> {new:?}");
            }
        }
    }

    #[test]
    fn upload_transition_waits_on_nothing() {
        let t = transition(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(t.src.stages, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(t.src.access, vk::AccessFlags::NONE);
        assert_eq!(t.dst.stages, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(t.dst.access, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn attachment_to_sampled() {
        let t = transition(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(t.src.access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert!(t.dst.stages.contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert!(t.dst.access.contains(vk::AccessFlags::SHADER_READ));
    }

    #[test]
    fn undefined_is_not_a_destination() {
        assert!(lookup(
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::UNDEFINED
        )
        .is_none());
        assert!(lookup(
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::PREINITIALIZED
        )
        .is_none());
    }

    #[test]
    #[should_panic(expected = "Unknown image layout transition")]
    fn unknown_layout_panics() {
        let _ = transition(
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::VIDEO_DECODE_DST_KHR,
        );
    }
}
