// sv_world.rs — world query functions
//
// Copyright (C) 1996-1997 Id Software, Inc.
// Licensed under the GNU General Public License v2 or later.
//
// Entity area checking: a fixed binary subdivision of the world bounds
// holds every solid or trigger edict in the deepest node that contains
// its absolute box. Move clipping first traces the world hull, then every
// solid edict the move's box overlaps.

use myq1_common::cmodel::{trace_hull, BoxHull, BrushModel, HullRef};
use myq1_common::q_shared::*;

use crate::pr_exec::{VmError, VmFault};
use crate::progs::{ev, gv};
use crate::server::*;

use std::sync::Arc;

pub const AREA_DEPTH: usize = 4;
pub const AREA_NODES: usize = 32;

pub const MOVE_NORMAL: i32 = 0;
pub const MOVE_NOMONSTERS: i32 = 1;
pub const MOVE_MISSILE: i32 = 2;

// ============================================================
// Area grid
// ============================================================

#[derive(Debug, Clone, Copy)]
pub struct AreaNode {
    pub axis: i32, // -1 = leaf node
    pub dist: f32,
    pub children: [usize; 2],
}

impl Default for AreaNode {
    fn default() -> Self {
        Self { axis: -1, dist: 0.0, children: [usize::MAX; 2] }
    }
}

/// Which list of a node an edict sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaList {
    Trigger = 0,
    Solid = 1,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: usize,
    next: usize,
}

/// The area tree plus intrusive doubly-linked lists threaded through
/// edict numbers. Link slots `0..max_edicts` belong to edicts; the two
/// list heads of node `n` follow them.
#[derive(Debug, Clone)]
pub struct AreaGrid {
    pub nodes: Vec<AreaNode>,
    links: Vec<Link>,
    node_of: Vec<Option<usize>>,
    max_edicts: usize,
}

impl AreaGrid {
    pub fn new(max_edicts: usize) -> Self {
        let mut grid = Self {
            nodes: Vec::with_capacity(AREA_NODES),
            links: Vec::new(),
            node_of: Vec::new(),
            max_edicts,
        };
        grid.clear(&[-4096.0; 3], &[4096.0; 3]);
        grid
    }

    #[inline]
    fn head(&self, node: usize, list: AreaList) -> usize {
        self.max_edicts + node * 2 + list as usize
    }

    /// Rebuild the tree for new world bounds. Every edict ends up unlinked.
    pub fn clear(&mut self, world_mins: &Vec3, world_maxs: &Vec3) {
        self.nodes.clear();
        self.create_area_node(0, world_mins, world_maxs);

        let total = self.max_edicts + AREA_NODES * 2;
        self.links = (0..total).map(|i| Link { prev: i, next: i }).collect();
        self.node_of = vec![None; self.max_edicts];
    }

    // Builds a uniformly subdivided tree for the given world size.
    fn create_area_node(&mut self, depth: usize, mins: &Vec3, maxs: &Vec3) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(AreaNode::default());

        if depth == AREA_DEPTH {
            return idx;
        }

        let size = vector_subtract(maxs, mins);
        let axis = if size[0] > size[1] { 0 } else { 1 };
        let dist = 0.5 * (maxs[axis] + mins[axis]);

        let mut maxs1 = *maxs;
        let mut mins2 = *mins;
        maxs1[axis] = dist;
        mins2[axis] = dist;

        let child0 = self.create_area_node(depth + 1, &mins2, maxs);
        let child1 = self.create_area_node(depth + 1, mins, &maxs1);

        self.nodes[idx] = AreaNode { axis: axis as i32, dist, children: [child0, child1] };
        idx
    }

    pub fn is_linked(&self, e: usize) -> bool {
        self.node_of.get(e).map_or(false, |n| n.is_some())
    }

    /// Node an edict is linked into.
    pub fn node_of(&self, e: usize) -> Option<usize> {
        self.node_of.get(e).copied().flatten()
    }

    /// Deepest node whose split the box does not cross.
    pub fn find_node(&self, absmin: &Vec3, absmax: &Vec3) -> usize {
        let mut n = 0;
        loop {
            let node = &self.nodes[n];
            if node.axis == -1 {
                break;
            }
            let axis = node.axis as usize;
            if absmin[axis] > node.dist {
                n = node.children[0];
            } else if absmax[axis] < node.dist {
                n = node.children[1];
            } else {
                break; // crosses the node
            }
        }
        n
    }

    pub fn insert(&mut self, node: usize, list: AreaList, e: usize) {
        self.remove(e);
        let head = self.head(node, list);
        let tail = self.links[head].prev;
        self.links[e] = Link { prev: tail, next: head };
        self.links[tail].next = e;
        self.links[head].prev = e;
        self.node_of[e] = Some(node);
    }

    /// Unlink in constant time. A no-op for unlinked edicts.
    pub fn remove(&mut self, e: usize) {
        if !self.is_linked(e) {
            return;
        }
        let Link { prev, next } = self.links[e];
        self.links[prev].next = next;
        self.links[next].prev = prev;
        self.links[e] = Link { prev: e, next: e };
        self.node_of[e] = None;
    }

    /// Edicts in one list of one node, in link order.
    pub fn list(&self, node: usize, list: AreaList) -> Vec<usize> {
        let head = self.head(node, list);
        let mut out = Vec::new();
        let mut l = self.links[head].next;
        while l != head {
            out.push(l);
            l = self.links[l].next;
        }
        out
    }

    /// Edicts in `list` of every node the box reaches. Only nodes whose
    /// split the box crosses or lies on the side of are visited.
    pub fn candidates(&self, mins: &Vec3, maxs: &Vec3, list: AreaList) -> Vec<usize> {
        let mut out = Vec::new();
        let mut pending = vec![0usize];
        while let Some(n) = pending.pop() {
            out.extend(self.list(n, list));
            let node = &self.nodes[n];
            if node.axis == -1 {
                continue;
            }
            let axis = node.axis as usize;
            if maxs[axis] > node.dist {
                pending.push(node.children[0]);
            }
            if mins[axis] < node.dist {
                pending.push(node.children[1]);
            }
        }
        out
    }
}

#[inline]
fn boxes_touch(amin: &Vec3, amax: &Vec3, bmin: &Vec3, bmax: &Vec3) -> bool {
    !(amin[0] > bmax[0]
        || amin[1] > bmax[1]
        || amin[2] > bmax[2]
        || amax[0] < bmin[0]
        || amax[1] < bmin[1]
        || amax[2] < bmin[2])
}

// ============================================================
// Move clipping
// ============================================================

/// The hull an edict clips with, and the offset that maps world space
/// into hull space.
pub enum EntityHull {
    Brush(Arc<BrushModel>, usize),
    Box(BoxHull),
}

impl EntityHull {
    pub fn as_ref(&self) -> HullRef<'_> {
        match self {
            EntityHull::Brush(model, h) => model.hulls[*h].as_ref(),
            EntityHull::Box(b) => b.as_ref(),
        }
    }
}

struct MoveClip {
    boxmins: Vec3, // enclose the test object along entire move
    boxmaxs: Vec3,
    mins: Vec3, // size of the moving object
    maxs: Vec3,
    mins2: Vec3, // size when clipping against monsters
    maxs2: Vec3,
    start: Vec3,
    end: Vec3,
    trace: Trace,
    move_type: i32,
    passedict: Option<usize>,
}

impl ServerContext {
    /// Rebuild the area grid for the current world model.
    pub fn clear_world(&mut self) {
        let mins = self.sv.worldmodel.mins;
        let maxs = self.sv.worldmodel.maxs;
        self.sv.area.clear(&mins, &maxs);
    }

    pub fn unlink_edict(&mut self, e: usize) {
        self.sv.area.remove(e);
    }

    /// Relink `e` after its position or size changed. With `touch_triggers`
    /// every trigger the new box overlaps fires its touch function before
    /// this returns.
    pub fn link_edict(&mut self, e: usize, touch_triggers: bool) -> Result<(), VmError> {
        self.unlink_edict(e); // unlink from old position

        if e == 0 {
            return Ok(()); // don't add the world
        }
        if self.sv.edicts[e].free {
            return Ok(());
        }

        // set the abs box
        let flags = self.edict_flags(e);
        let ed = &mut self.sv.edicts[e];
        let origin = ed.origin();
        let mut absmin = vector_add(&origin, &ed.vector(ev::MINS));
        let mut absmax = vector_add(&origin, &ed.vector(ev::MAXS));

        // to make items easier to pick up and allow them to be grabbed off
        // of shelves, the abs sizes are expanded
        if flags.contains(EdictFlags::ITEM) {
            absmin[0] -= 15.0;
            absmin[1] -= 15.0;
            absmax[0] += 15.0;
            absmax[1] += 15.0;
        } else {
            // because movement is clipped an epsilon away from an actual edge,
            // we must fully check even when bounding boxes don't quite touch
            for i in 0..3 {
                absmin[i] -= 1.0;
                absmax[i] += 1.0;
            }
        }
        ed.set_vector(ev::ABSMIN, &absmin);
        ed.set_vector(ev::ABSMAX, &absmax);

        // link to PVS leafs
        ed.num_leafs = 0;
        if ed.float(ev::MODELINDEX) != 0.0 {
            let leafs = self.sv.worldmodel.box_leafs(&absmin, &absmax, MAX_ENT_LEAFS);
            let ed = &mut self.sv.edicts[e];
            ed.num_leafs = leafs.len();
            ed.leafnums[..leafs.len()].copy_from_slice(&leafs);
        }

        let solid = self.sv.edicts[e].solid();
        if solid == SOLID_NOT {
            return Ok(());
        }

        // find the first node that the ent's box crosses
        let node = self.sv.area.find_node(&absmin, &absmax);
        let list = if solid == SOLID_TRIGGER { AreaList::Trigger } else { AreaList::Solid };
        self.sv.area.insert(node, list, e);

        if touch_triggers {
            self.touch_links(e)?;
        }
        Ok(())
    }

    /// Edicts of either kind whose absolute boxes touch the given box.
    pub fn entities_in_box(&self, mins: &Vec3, maxs: &Vec3) -> Vec<usize> {
        let mut out = self.area_edicts(mins, maxs, AreaList::Solid);
        out.extend(self.area_edicts(mins, maxs, AreaList::Trigger));
        out
    }

    pub fn area_edicts(&self, mins: &Vec3, maxs: &Vec3, list: AreaList) -> Vec<usize> {
        self.sv
            .area
            .candidates(mins, maxs, list)
            .into_iter()
            .filter(|&e| {
                let ed = &self.sv.edicts[e];
                ed.solid() != SOLID_NOT
                    && boxes_touch(&ed.vector(ev::ABSMIN), &ed.vector(ev::ABSMAX), mins, maxs)
            })
            .collect()
    }

    fn touch_links(&mut self, e: usize) -> Result<(), VmError> {
        let absmin = self.sv.edicts[e].vector(ev::ABSMIN);
        let absmax = self.sv.edicts[e].vector(ev::ABSMAX);

        for touch in self.area_edicts(&absmin, &absmax, AreaList::Trigger) {
            if touch == e {
                continue;
            }
            let t = &self.sv.edicts[touch];
            // an earlier touch may have removed or moved it
            if t.free || t.function(ev::TOUCH) == 0 || t.solid() != SOLID_TRIGGER {
                continue;
            }
            if !boxes_touch(&absmin, &absmax, &t.vector(ev::ABSMIN), &t.vector(ev::ABSMAX)) {
                continue;
            }

            let old_self = self.pr.g_edict(gv::SELF);
            let old_other = self.pr.g_edict(gv::OTHER);

            let func = self.sv.edicts[touch].function(ev::TOUCH);
            self.pr.set_g_edict(gv::SELF, touch);
            self.pr.set_g_edict(gv::OTHER, e);
            self.pr.set_g_float(gv::TIME, self.sv.time as f32);
            self.execute_program(func)?;

            self.pr.set_g_edict(gv::SELF, old_self);
            self.pr.set_g_edict(gv::OTHER, old_other);
        }
        Ok(())
    }

    // ============================================================
    // Point contents
    // ============================================================

    pub fn true_point_contents(&self, p: &Vec3) -> i32 {
        let hull = &self.sv.worldmodel.hulls[0];
        if hull.is_empty() {
            return CONTENTS_EMPTY;
        }
        hull.as_ref().point_contents(hull.firstclipnode, p)
    }

    /// Contents at `p`, with water currents reported as plain water.
    pub fn point_contents(&self, p: &Vec3) -> i32 {
        let cont = self.true_point_contents(p);
        if cont <= CONTENTS_CURRENT_0 && cont >= CONTENTS_CURRENT_DOWN {
            CONTENTS_WATER
        } else {
            cont
        }
    }

    /// The world if the edict's box is stuck in something, None if it is
    /// free to move.
    pub fn test_entity_position(&mut self, e: usize) -> Result<Option<usize>, VmError> {
        let ed = &self.sv.edicts[e];
        let origin = ed.origin();
        let mins = ed.vector(ev::MINS);
        let maxs = ed.vector(ev::MAXS);
        let trace = self.sv_move(&origin, &mins, &maxs, &origin, MOVE_NORMAL, Some(e))?;
        Ok(if trace.startsolid { Some(0) } else { None })
    }

    // ============================================================
    // Line testing
    // ============================================================

    /// Hull to clip a moving box of `mins..maxs` against edict `e`, with
    /// the offset from world space to hull space.
    pub fn hull_for_entity(&self, e: usize, mins: &Vec3, maxs: &Vec3) -> Result<(EntityHull, Vec3), VmError> {
        let ed = &self.sv.edicts[e];
        let origin = ed.origin();

        // decide which clipping hull to use, based on the size
        if ed.solid() == SOLID_BSP {
            // explicit hulls in the BSP model
            if ed.movetype() != MOVETYPE_PUSH {
                return Err(self.run_error(VmFault::Script("SOLID_BSP without MOVETYPE_PUSH".into())));
            }
            let index = ed.float(ev::MODELINDEX) as usize;
            let Some(model) = self.model(index).and_then(ServerModel::brush).cloned() else {
                return Err(self.run_error(VmFault::Script("MOVETYPE_PUSH with a non bsp model".into())));
            };

            let size = vector_subtract(maxs, mins);
            let h = if size[0] < 3.0 {
                0
            } else if size[0] <= 32.0 {
                1
            } else {
                2
            };

            // calculate an offset value to center the origin
            let clip_mins = model.hulls[h].clip_mins;
            let offset = vector_add(&vector_subtract(&clip_mins, mins), &origin);
            Ok((EntityHull::Brush(model, h), offset))
        } else {
            // create a temp hull from bounding box sizes
            let hullmins = vector_subtract(&ed.vector(ev::MINS), maxs);
            let hullmaxs = vector_subtract(&ed.vector(ev::MAXS), mins);
            Ok((EntityHull::Box(BoxHull::new(&hullmins, &hullmaxs)), origin))
        }
    }

    /// Trace a box against a single edict.
    pub fn clip_move_to_entity(
        &self,
        e: usize,
        start: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        end: &Vec3,
    ) -> Result<Trace, VmError> {
        let (hull, offset) = self.hull_for_entity(e, mins, maxs)?;
        let mut trace = trace_hull(&hull.as_ref(), &offset, start, end);

        // did we clip the move?
        if trace.fraction < 1.0 || trace.startsolid {
            trace.ent = Some(e);
        }
        Ok(trace)
    }

    fn clip_to_links(&self, clip: &mut MoveClip) -> Result<(), VmError> {
        for touch in self.area_edicts(&clip.boxmins, &clip.boxmaxs, AreaList::Solid) {
            let t = &self.sv.edicts[touch];
            if t.solid() == SOLID_NOT || Some(touch) == clip.passedict {
                continue;
            }
            if t.solid() == SOLID_TRIGGER {
                return Err(self.run_error(VmFault::Script("Trigger in clipping list".into())));
            }
            if clip.move_type == MOVE_NOMONSTERS && t.solid() != SOLID_BSP {
                continue;
            }

            if let Some(pass) = clip.passedict {
                let p = &self.sv.edicts[pass];
                if p.float(ev::SIZE) != 0.0 && t.float(ev::SIZE) == 0.0 {
                    continue; // points never interact
                }
            }

            // might intersect, so do an exact clip
            if clip.trace.allsolid {
                return Ok(());
            }
            if let Some(pass) = clip.passedict {
                if t.entity(ev::OWNER) == pass {
                    continue; // don't clip against own missiles
                }
                if self.sv.edicts[pass].entity(ev::OWNER) == touch {
                    continue; // don't clip against owner
                }
            }

            let monster = EdictFlags::from_bits_retain(t.float(ev::FLAGS) as i32).contains(EdictFlags::MONSTER);
            let trace = if monster {
                self.clip_move_to_entity(touch, &clip.start, &clip.mins2, &clip.maxs2, &clip.end)?
            } else {
                self.clip_move_to_entity(touch, &clip.start, &clip.mins, &clip.maxs, &clip.end)?
            };

            if trace.allsolid || trace.startsolid || trace.fraction < clip.trace.fraction {
                let mut trace = trace;
                trace.ent = Some(touch);
                if clip.trace.startsolid {
                    clip.trace = trace;
                    clip.trace.startsolid = true;
                } else {
                    clip.trace = trace;
                }
            } else if trace.startsolid {
                clip.trace.startsolid = true;
            }
        }
        Ok(())
    }

    /// Sweep a box through the world and every solid edict.
    ///
    /// `move_type` MOVE_NOMONSTERS ignores everything but brush models;
    /// MOVE_MISSILE grows the box to 15 units against monsters. The pass
    /// edict, its owner and anything it owns are never hit.
    pub fn sv_move(
        &self,
        start: &Vec3,
        mins: &Vec3,
        maxs: &Vec3,
        end: &Vec3,
        move_type: i32,
        passedict: Option<usize>,
    ) -> Result<Trace, VmError> {
        // clip to world
        let world_trace = self.clip_move_to_entity(0, start, mins, maxs, end)?;

        let (mins2, maxs2) = if move_type == MOVE_MISSILE {
            ([-15.0; 3], [15.0; 3])
        } else {
            (*mins, *maxs)
        };

        // create the bounding box of the entire move
        let mut boxmins = [0.0; 3];
        let mut boxmaxs = [0.0; 3];
        for i in 0..3 {
            if end[i] > start[i] {
                boxmins[i] = start[i] + mins2[i] - 1.0;
                boxmaxs[i] = end[i] + maxs2[i] + 1.0;
            } else {
                boxmins[i] = end[i] + mins2[i] - 1.0;
                boxmaxs[i] = start[i] + maxs2[i] + 1.0;
            }
        }

        let mut clip = MoveClip {
            boxmins,
            boxmaxs,
            mins: *mins,
            maxs: *maxs,
            mins2,
            maxs2,
            start: *start,
            end: *end,
            trace: world_trace,
            move_type,
            passedict,
        };

        // clip to entities
        self.clip_to_links(&mut clip)?;
        Ok(clip.trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progs::testprogs::ProgsBuilder;
    use crate::progs::{Opcode, Progs, ProgsDat};
    use crate::sv_edict::Edict;
    use assert_approx_eq::assert_approx_eq;

    fn world_context(b: &ProgsBuilder) -> ServerContext {
        let mut ctx = ServerContext::new(Box::new(MemoryAssets::default()));
        ctx.pr = Progs::new(ProgsDat::from_bytes(&b.build()).expect("progs"));
        let room = BrushModel::room("maps/test.bsp", &[-256.0; 3], &[256.0; 3]);
        ctx.sv.worldmodel = Arc::new(room.clone());
        ctx.sv.model_precache = vec![String::new(), "maps/test.bsp".into()];
        ctx.sv.models = vec![None, Some(ServerModel::Brush(Arc::new(room)))];
        ctx.clear_world();
        ctx.sv.edicts.push(Edict::new(ctx.pr.entityfields()));
        ctx.sv.edicts[0].set_float(ev::SOLID, SOLID_BSP as f32);
        ctx.sv.edicts[0].set_float(ev::MOVETYPE, MOVETYPE_PUSH as f32);
        ctx.sv.edicts[0].set_float(ev::MODELINDEX, 1.0);
        ctx.sv.edicts.push(Edict::new(ctx.pr.entityfields()));
        ctx
    }

    fn spawn_box(ctx: &mut ServerContext, origin: Vec3, solid: i32) -> usize {
        let e = ctx.ed_alloc().unwrap();
        let ed = ctx.edict_mut(e);
        ed.set_vector(ev::ORIGIN, &origin);
        ed.set_vector(ev::MINS, &[-16.0, -16.0, -24.0]);
        ed.set_vector(ev::MAXS, &[16.0, 16.0, 32.0]);
        ed.set_vector(ev::SIZE, &[32.0, 32.0, 56.0]);
        ed.set_float(ev::SOLID, solid as f32);
        e
    }

    #[test]
    fn test_area_tree_shape() {
        let grid = AreaGrid::new(16);
        assert_eq!(grid.nodes.len(), 31);
        assert_eq!(grid.nodes[0].axis, 1, "square bounds split on y first");
        assert_eq!(grid.nodes[0].dist, 0.0);
    }

    #[test]
    fn test_link_then_query_finds_entity() {
        let mut ctx = world_context(&ProgsBuilder::new());
        let e = spawn_box(&mut ctx, [100.0, 50.0, 0.0], SOLID_BBOX);
        ctx.link_edict(e, false).unwrap();
        let ed = ctx.edict(e);
        let (mins, maxs) = (ed.vector(ev::ABSMIN), ed.vector(ev::ABSMAX));
        assert_approx_eq!(mins[0], 100.0 - 17.0);
        assert!(ctx.entities_in_box(&mins, &maxs).contains(&e));

        ctx.unlink_edict(e);
        assert!(!ctx.entities_in_box(&mins, &maxs).contains(&e));
        ctx.unlink_edict(e); // harmless twice
    }

    #[test]
    fn test_straddling_box_stays_near_root() {
        let mut ctx = world_context(&ProgsBuilder::new());
        let e = spawn_box(&mut ctx, [0.0, 0.0, 0.0], SOLID_BBOX);
        ctx.link_edict(e, false).unwrap();
        assert_eq!(ctx.sv.area.node_of(e), Some(0));

        let far = spawn_box(&mut ctx, [200.0, 200.0, 0.0], SOLID_BBOX);
        ctx.link_edict(far, false).unwrap();
        assert_ne!(ctx.sv.area.node_of(far), Some(0));
    }

    #[test]
    fn test_unlink_is_constant_time_removal_from_middle() {
        let mut grid = AreaGrid::new(8);
        grid.insert(3, AreaList::Solid, 1);
        grid.insert(3, AreaList::Solid, 2);
        grid.insert(3, AreaList::Solid, 5);
        grid.remove(2);
        assert_eq!(grid.list(3, AreaList::Solid), vec![1, 5]);
        grid.insert(4, AreaList::Trigger, 1);
        assert_eq!(grid.list(3, AreaList::Solid), vec![5]);
        assert_eq!(grid.list(4, AreaList::Trigger), vec![1]);
    }

    #[test]
    fn test_trace_hits_floor_of_world() {
        let ctx = world_context(&ProgsBuilder::new());
        let t = ctx
            .sv_move(&[0.0, 0.0, 0.0], &[-16.0, -16.0, -24.0], &[16.0, 16.0, 32.0], &[0.0, 0.0, -1000.0], MOVE_NORMAL, None)
            .unwrap();
        assert!(t.fraction < 1.0);
        assert_eq!(t.ent, Some(0));
        assert_approx_eq!(t.plane.normal[2], 1.0);
        assert_approx_eq!(t.endpos[2], -256.0 + 24.0, 0.1);
    }

    #[test]
    fn test_world_without_player_hull_does_not_clip_boxes() {
        let mut ctx = world_context(&ProgsBuilder::new());
        let mut room = BrushModel::room("maps/test.bsp", &[-256.0; 3], &[256.0; 3]);
        room.hulls[1] = Default::default();
        room.hulls[2] = Default::default();
        assert!(room.validate().is_err());
        ctx.sv.models[1] = Some(ServerModel::Brush(Arc::new(room)));

        let t = ctx
            .sv_move(&[0.0; 3], &[-16.0, -16.0, -24.0], &[16.0, 16.0, 32.0], &[0.0, 0.0, -1000.0], MOVE_NORMAL, None)
            .unwrap();
        assert_eq!(t.fraction, 1.0);
        assert!(!t.startsolid);
    }

    #[test]
    fn test_trace_hits_entity_before_world() {
        let mut ctx = world_context(&ProgsBuilder::new());
        let e = spawn_box(&mut ctx, [100.0, 0.0, 0.0], SOLID_BBOX);
        ctx.link_edict(e, false).unwrap();
        let t = ctx.sv_move(&[0.0; 3], &[0.0; 3], &[0.0; 3], &[200.0, 0.0, 0.0], MOVE_NORMAL, None).unwrap();
        assert_eq!(t.ent, Some(e));
        assert_approx_eq!(t.endpos[0], 84.0, 0.1);

        // the pass edict is ignored
        let t = ctx.sv_move(&[0.0; 3], &[0.0; 3], &[0.0; 3], &[200.0, 0.0, 0.0], MOVE_NORMAL, Some(e)).unwrap();
        assert_eq!(t.fraction, 1.0);

        // nomonsters ignores boxes
        let t = ctx.sv_move(&[0.0; 3], &[0.0; 3], &[0.0; 3], &[200.0, 0.0, 0.0], MOVE_NOMONSTERS, None).unwrap();
        assert_eq!(t.fraction, 1.0);
    }

    #[test]
    fn test_missile_box_grows_against_monsters() {
        let mut ctx = world_context(&ProgsBuilder::new());
        let e = spawn_box(&mut ctx, [100.0, 25.0, 0.0], SOLID_SLIDEBOX);
        ctx.edict_mut(e).set_float(ev::FLAGS, EdictFlags::MONSTER.bits() as f32);
        ctx.link_edict(e, false).unwrap();

        let t = ctx.sv_move(&[0.0; 3], &[0.0; 3], &[0.0; 3], &[200.0, 0.0, 0.0], MOVE_NORMAL, None).unwrap();
        assert_eq!(t.fraction, 1.0, "a point passes 9 units beside the box");
        let t = ctx.sv_move(&[0.0; 3], &[0.0; 3], &[0.0; 3], &[200.0, 0.0, 0.0], MOVE_MISSILE, None).unwrap();
        assert_eq!(t.ent, Some(e));
    }

    #[test]
    fn test_owner_does_not_block_its_missile() {
        let mut ctx = world_context(&ProgsBuilder::new());
        let owner = spawn_box(&mut ctx, [100.0, 0.0, 0.0], SOLID_BBOX);
        ctx.link_edict(owner, false).unwrap();
        let missile = spawn_box(&mut ctx, [0.0, 0.0, 0.0], SOLID_BBOX);
        ctx.edict_mut(missile).set_entity(ev::OWNER, owner);
        let t = ctx.sv_move(&[0.0; 3], &[0.0; 3], &[0.0; 3], &[200.0, 0.0, 0.0], MOVE_NORMAL, Some(missile)).unwrap();
        assert_eq!(t.fraction, 1.0);
    }

    #[test]
    fn test_point_contents_and_stuck_test() {
        let mut ctx = world_context(&ProgsBuilder::new());
        assert_eq!(ctx.point_contents(&[0.0; 3]), CONTENTS_EMPTY);
        assert_eq!(ctx.point_contents(&[0.0, 0.0, 1000.0]), CONTENTS_SOLID);

        let e = spawn_box(&mut ctx, [0.0, 0.0, 0.0], SOLID_BBOX);
        assert_eq!(ctx.test_entity_position(e).unwrap(), None);
        ctx.edict_mut(e).set_vector(ev::ORIGIN, &[0.0, 0.0, -250.0]);
        assert_eq!(ctx.test_entity_position(e).unwrap(), Some(0));
    }

    #[test]
    fn test_trigger_touch_fires_once_per_link() {
        let mut b = ProgsBuilder::new();
        let counter = b.alloc_globals(1);
        let one = b.float_const(1.0);
        let touch = b.function("trigger_touch", 0, 0, 0);
        b.op(Opcode::ADD_F, counter, one, counter);
        b.op(Opcode::DONE, 0, 0, 0);

        let mut ctx = world_context(&b);
        let trigger = spawn_box(&mut ctx, [0.0, 0.0, 0.0], SOLID_TRIGGER);
        ctx.edict_mut(trigger).set_function(ev::TOUCH, touch as i32);
        ctx.link_edict(trigger, false).unwrap();
        assert_eq!(ctx.pr.g_float(counter), 0.0, "linking the trigger itself touches nothing");

        let player = spawn_box(&mut ctx, [10.0, 0.0, 0.0], SOLID_SLIDEBOX);
        ctx.link_edict(player, true).unwrap();
        assert_eq!(ctx.pr.g_float(counter), 1.0);
        ctx.link_edict(player, true).unwrap();
        assert_eq!(ctx.pr.g_float(counter), 2.0);
        ctx.link_edict(player, false).unwrap();
        assert_eq!(ctx.pr.g_float(counter), 2.0);

        ctx.edict_mut(player).set_vector(ev::ORIGIN, &[200.0, 0.0, 0.0]);
        ctx.link_edict(player, true).unwrap();
        assert_eq!(ctx.pr.g_float(counter), 2.0, "no touch once apart");
    }
}
