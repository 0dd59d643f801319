//! Alias arena and the views that derive from it.
//!
//! An alias holds the IR value every view in a family was derived from, plus the writes
//! made through those views that have not yet been folded into it. Views keep only an
//! [`AliasId`]; the arena counts the views installed in tensor records, plus detached
//! views not yet wrapped in a tensor, and frees an alias when the last one is released.

use std::collections::HashMap;

use log::trace;

use crate::ir::{ops, Value};
use crate::tensor::TensorSpec;

use super::info::{ViewInfo, ViewType};

/// Non-owning reference to an alias. Ids start at 1; 0 means "no alias".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AliasId(pub u64);

struct UpdateData {
    ir_value: Value,
    view_infos: Vec<ViewInfo>,
}

struct Alias {
    root_ir_value: Value,
    updates: Vec<UpdateData>,
    generation: u64,
    refs: usize,
}

/// Owner of every alias node in a context.
#[derive(Default)]
pub struct AliasArena {
    next_id: u64,
    aliases: HashMap<AliasId, Alias>,
}

impl AliasArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an alias rooted at `root`. It lives until the first installed view
    /// referencing it is released and no other references remain.
    pub fn create(&mut self, root: Value) -> AliasId {
        self.next_id += 1;
        let id = AliasId(self.next_id);
        self.aliases.insert(
            id,
            Alias {
                root_ir_value: root,
                updates: Vec::new(),
                generation: 0,
                refs: 0,
            },
        );
        id
    }

    pub(crate) fn retain(&mut self, id: AliasId) {
        self.get_mut(id).refs += 1;
    }

    pub(crate) fn release(&mut self, id: AliasId) {
        let alias = self.get_mut(id);
        alias.refs = alias.refs.saturating_sub(1);
        if alias.refs == 0 {
            trace!("releasing alias {}", id.0);
            self.aliases.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    pub fn contains(&self, id: AliasId) -> bool {
        self.aliases.contains_key(&id)
    }

    pub fn generation(&self, id: AliasId) -> u64 {
        self.get(id).generation
    }

    /// Records a write through a view chain. Consecutive writes through the same chain
    /// replace each other instead of stacking up.
    pub fn update(&mut self, id: AliasId, ir_value: Value, view_infos: &[ViewInfo]) {
        let alias = self.get_mut(id);
        match alias.updates.last_mut() {
            Some(last) if last.view_infos == view_infos => last.ir_value = ir_value,
            _ => alias.updates.push(UpdateData {
                ir_value,
                view_infos: view_infos.to_vec(),
            }),
        }
        alias.generation += 1;
    }

    /// Folds pending writes into the root value and returns it.
    pub fn sync_update_operations(&mut self, id: AliasId) -> Value {
        let alias = self.get_mut(id);
        for update in alias.updates.drain(..) {
            alias.root_ir_value = apply_update(alias.root_ir_value.clone(), &update);
        }
        alias.root_ir_value.clone()
    }

    fn get(&self, id: AliasId) -> &Alias {
        self.aliases
            .get(&id)
            .unwrap_or_else(|| panic!("alias {} accessed after release", id.0))
    }

    fn get_mut(&mut self, id: AliasId) -> &mut Alias {
        self.aliases
            .get_mut(&id)
            .unwrap_or_else(|| panic!("alias {} accessed after release", id.0))
    }
}

/// A tensor's window onto an alias through a chain of view transforms.
#[derive(Debug)]
pub struct View {
    shape: TensorSpec,
    alias: AliasId,
    view_infos: Vec<ViewInfo>,
    ir_value: Option<Value>,
    generation: u64,
}

impl View {
    pub(crate) fn new(shape: TensorSpec, alias: AliasId, view_info: ViewInfo) -> Self {
        View {
            shape,
            alias,
            view_infos: vec![view_info],
            ir_value: None,
            generation: 0,
        }
    }

    pub fn shape(&self) -> &TensorSpec {
        &self.shape
    }

    pub fn alias_id(&self) -> AliasId {
        self.alias
    }

    pub fn view_infos(&self) -> &[ViewInfo] {
        &self.view_infos
    }

    /// Composes `view_info` on top of this chain under the same alias.
    pub(crate) fn create_sub_view(&self, shape: TensorSpec, view_info: ViewInfo) -> View {
        let mut view_infos = self.view_infos.clone();
        view_infos.push(view_info);
        View {
            shape,
            alias: self.alias,
            view_infos,
            ir_value: None,
            generation: 0,
        }
    }

    /// Writes `ir_value` through this view into the alias.
    pub(crate) fn update(&self, aliases: &mut AliasArena, ir_value: Value) {
        aliases.update(self.alias, ir_value, &self.view_infos);
    }

    pub(crate) fn is_up_to_date(&self, aliases: &AliasArena) -> bool {
        self.ir_value.is_some() && self.generation == aliases.generation(self.alias)
    }

    /// Current IR for this view and whether it had to be recomputed.
    pub(crate) fn get_view_ir_node(&mut self, aliases: &mut AliasArena) -> (Value, bool) {
        if let Some(ir_value) = &self.ir_value {
            if self.generation == aliases.generation(self.alias) {
                return (ir_value.clone(), false);
            }
        }
        let mut update = aliases.sync_update_operations(self.alias);
        for view_info in &self.view_infos {
            update = apply_view_info(update, view_info);
        }
        self.ir_value = Some(update.clone());
        self.generation = aliases.generation(self.alias);
        (update, true)
    }
}

/// Forward application of one view step.
pub(crate) fn apply_view_info(ir_value: Value, view_info: &ViewInfo) -> Value {
    match view_info.view_type {
        ViewType::NoOp => ir_value,
        ViewType::Select => {
            let select = view_info
                .select
                .clone()
                .unwrap_or_else(|| panic!("select view without select info"));
            ops::select(ir_value, select)
        }
        ViewType::Narrow => ops::narrow(
            ir_value,
            view_info.indices.clone(),
            view_info.shape.shape.clone(),
        ),
        ViewType::Permute => ops::permute(ir_value, view_info.permutation.clone()),
        ViewType::Reshape => ops::reshape(ir_value, view_info.shape.shape.clone()),
        ViewType::Resize => ops::resize(ir_value, view_info.shape.shape.clone()),
    }
}

/// Folds one write into `ir_value`: walk the chain forward to get each intermediate source,
/// then propagate the written value back through the chain in reverse.
fn apply_update(ir_value: Value, update: &UpdateData) -> Value {
    let mut sources = Vec::with_capacity(update.view_infos.len() + 1);
    sources.push(ir_value);
    for view_info in &update.view_infos {
        let next = apply_view_info(sources[sources.len() - 1].clone(), view_info);
        sources.push(next);
    }
    let mut result = update.ir_value.clone();
    for (index, view_info) in update.view_infos.iter().enumerate().rev() {
        result = match view_info.view_type {
            ViewType::NoOp => result,
            ViewType::Select => {
                let select = view_info
                    .select
                    .clone()
                    .unwrap_or_else(|| panic!("select view without select info"));
                ops::select_update(sources[index].clone(), result, select)
            }
            ViewType::Narrow => {
                ops::narrow_update(sources[index].clone(), result, view_info.indices.clone())
            }
            ViewType::Permute => ops::permute(
                result,
                ops::inverse_permutation(&view_info.permutation),
            ),
            ViewType::Reshape => ops::reshape(result, view_info.source_shape.shape.clone()),
            ViewType::Resize => ops::resize(result, view_info.source_shape.shape.clone()),
        };
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::OpKind;
    use crate::tensor::{DType, ScalarValue, Shape};

    fn leaf(dims: &[usize]) -> Value {
        let scalar = ops::scalar(ScalarValue::Float(0.0), DType::F32);
        ops::resize(scalar, Shape::new(dims.to_vec()))
    }

    #[test]
    fn consecutive_updates_through_same_chain_coalesce() {
        let mut aliases = AliasArena::new();
        let root = leaf(&[4]);
        let id = aliases.create(root.clone());
        let info = vec![ViewInfo::no_op(root.spec().clone())];
        aliases.update(id, leaf(&[4]), &info);
        let last = leaf(&[4]);
        aliases.update(id, last.clone(), &info);
        assert_eq!(aliases.generation(id), 2);
        assert_eq!(aliases.sync_update_operations(id), last);
    }

    #[test]
    fn narrow_write_back_becomes_narrow_update() {
        let mut aliases = AliasArena::new();
        let root = leaf(&[4, 4]);
        let id = aliases.create(root.clone());
        let info = ViewInfo::narrow(root.spec().clone(), vec![1, 0], Shape::new([2, 4]));
        let view = View::new(info.shape.clone(), id, info);
        view.update(&mut aliases, leaf(&[2, 4]));
        let synced = aliases.sync_update_operations(id);
        assert!(matches!(
            synced.node().op(),
            OpKind::NarrowUpdate { offsets } if offsets == &[1, 0]
        ));
        assert_eq!(synced.spec(), root.spec());
    }

    #[test]
    fn view_recomputes_only_after_alias_changes() {
        let mut aliases = AliasArena::new();
        let root = leaf(&[2, 3]);
        let id = aliases.create(root.clone());
        let info = ViewInfo::permute(root.spec().clone(), vec![1, 0]);
        let mut view = View::new(info.shape.clone(), id, info);
        assert!(!view.is_up_to_date(&aliases));
        let (first, updated) = view.get_view_ir_node(&mut aliases);
        assert!(updated);
        let (second, updated) = view.get_view_ir_node(&mut aliases);
        assert!(!updated);
        assert_eq!(first, second);
        view.update(&mut aliases, leaf(&[3, 2]));
        assert!(!view.is_up_to_date(&aliases));
    }

    #[test]
    fn alias_freed_with_last_reference() {
        let mut aliases = AliasArena::new();
        let id = aliases.create(leaf(&[1]));
        aliases.retain(id);
        aliases.retain(id);
        aliases.release(id);
        assert!(aliases.contains(id));
        aliases.release(id);
        assert!(aliases.is_empty());
    }
}
