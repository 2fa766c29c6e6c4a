use crate::inst::{Inst, InstRef};
use crate::state::{StateInfo, VRegsInfo};

/// Index of a block in its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// A basic block: an ordered instruction list plus CFG edges.
#[derive(Debug)]
pub struct Block {
    id: u32,
    pub insts: Vec<InstRef>,
    pub succs: Vec<BlockId>,
    pub preds: Vec<BlockId>,
}

impl Block {
    pub fn id(&self) -> BlockId {
        BlockId(self.id)
    }
}

/// An arena-style CFG under construction: index-addressed pools of
/// instructions and blocks, the per-region virtual register table,
/// and the builder's insertion cursor. Discarded wholesale after
/// code generation.
pub struct Region {
    insts: Vec<Inst>,
    blocks: Vec<Block>,
    layout: Vec<BlockId>,
    vregs: VRegsInfo,
    cur: BlockId,
}

impl Region {
    pub fn new(state_info: &'static StateInfo) -> Self {
        Self {
            insts: Vec::with_capacity(256),
            blocks: Vec::with_capacity(8),
            layout: Vec::with_capacity(8),
            vregs: VRegsInfo::new(state_info),
            cur: BlockId(0),
        }
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id: id.0,
            insts: Vec::new(),
            succs: Vec::new(),
            preds: Vec::new(),
        });
        self.layout.push(id);
        id
    }

    #[inline]
    pub fn num_blocks(&self) -> u32 {
        self.blocks.len() as u32
    }

    #[inline]
    pub fn num_insts(&self) -> u32 {
        self.insts.len() as u32
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn inst(&self, r: InstRef) -> &Inst {
        &self.insts[r.0 as usize]
    }

    pub fn inst_mut(&mut self, r: InstRef) -> &mut Inst {
        &mut self.insts[r.0 as usize]
    }

    /// Set the builder cursor; subsequent create_* calls append to
    /// this block.
    pub fn set_cursor(&mut self, bb: BlockId) {
        self.cur = bb;
    }

    #[inline]
    pub fn cursor(&self) -> BlockId {
        self.cur
    }

    pub fn add_succ(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.0 as usize].succs.push(to);
        self.blocks[to.0 as usize].preds.push(from);
    }

    #[inline]
    pub fn vregs(&self) -> &VRegsInfo {
        &self.vregs
    }

    #[inline]
    pub fn vregs_mut(&mut self) -> &mut VRegsInfo {
        &mut self.vregs
    }

    /// Block emission order; initially creation order, rewritten by
    /// the layout pass.
    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    pub fn set_layout(&mut self, order: Vec<BlockId>) {
        assert_eq!(order.len(), self.blocks.len());
        self.layout = order;
    }

    pub(crate) fn push_inst(&mut self, inst: Inst) -> InstRef {
        let r = InstRef(self.insts.len() as u32);
        self.insts.push(inst);
        self.blocks[self.cur.0 as usize].insts.push(r);
        r
    }

    pub(crate) fn next_inst_id(&self) -> u32 {
        self.insts.len() as u32
    }

    /// Instructions of one block in program order.
    pub fn block_insts(&self, bb: BlockId) -> impl Iterator<Item = &Inst> {
        self.blocks[bb.0 as usize]
            .insts
            .iter()
            .map(move |r| &self.insts[r.0 as usize])
    }
}
