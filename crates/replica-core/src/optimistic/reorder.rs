//! Reorder planning for parent/child ordered items
//!
//! `plan_reorder` is pure: given every item in a scope, the moved item and
//! its destination, it returns the placements that change. Siblings under
//! the destination parent are renumbered `0..n`, and so are the siblings left
//! behind when an item changes parent, so ordering keys under any parent the
//! plan touches are distinct and increasing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Parent and position of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub id: String,
    pub parent_id: Option<String>,
    pub order_index: i64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReorderError {
    #[error("Unknown item '{0}'")]
    UnknownItem(String),

    #[error("Cannot move '{0}' under itself or one of its descendants")]
    Cycle(String),
}

/// Plan moving `moved` to position `new_index` under `new_parent`
pub fn plan_reorder(
    items: &[Placement],
    moved: &str,
    new_parent: Option<&str>,
    new_index: usize,
) -> Result<Vec<Placement>, ReorderError> {
    let by_id: HashMap<&str, &Placement> = items.iter().map(|p| (p.id.as_str(), p)).collect();
    let current = by_id
        .get(moved)
        .ok_or_else(|| ReorderError::UnknownItem(moved.to_string()))?;

    if let Some(parent) = new_parent {
        if !by_id.contains_key(parent) {
            return Err(ReorderError::UnknownItem(parent.to_string()));
        }
        // Walk up from the destination; meeting the moved item means a cycle
        let mut cursor = Some(parent);
        let mut steps = 0;
        while let Some(id) = cursor {
            if id == moved {
                return Err(ReorderError::Cycle(moved.to_string()));
            }
            steps += 1;
            if steps > items.len() {
                break;
            }
            cursor = by_id.get(id).and_then(|p| p.parent_id.as_deref());
        }
    }

    let mut target = siblings(items, new_parent, moved);
    let index = new_index.min(target.len());
    target.insert(index, moved);

    let mut planned: Vec<Placement> = target
        .iter()
        .enumerate()
        .map(|(i, id)| Placement {
            id: (*id).to_string(),
            parent_id: new_parent.map(str::to_string),
            order_index: i as i64,
        })
        .collect();

    let old_parent = current.parent_id.as_deref();
    if old_parent != new_parent {
        planned.extend(
            siblings(items, old_parent, moved)
                .iter()
                .enumerate()
                .map(|(i, id)| Placement {
                    id: (*id).to_string(),
                    parent_id: old_parent.map(str::to_string),
                    order_index: i as i64,
                }),
        );
    }

    Ok(planned
        .into_iter()
        .filter(|p| by_id.get(p.id.as_str()).map_or(true, |before| *before != p))
        .collect())
}

/// Ids under `parent` in display order, excluding `skip`
fn siblings<'a>(items: &'a [Placement], parent: Option<&str>, skip: &str) -> Vec<&'a str> {
    let mut under: Vec<&Placement> = items
        .iter()
        .filter(|p| p.parent_id.as_deref() == parent && p.id != skip)
        .collect();
    under.sort_by(|a, b| a.order_index.cmp(&b.order_index).then_with(|| a.id.cmp(&b.id)));
    under.into_iter().map(|p| p.id.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn item(id: &str, parent: Option<&str>, index: i64) -> Placement {
        Placement {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            order_index: index,
        }
    }

    fn apply(items: &mut [Placement], changes: &[Placement]) {
        for change in changes {
            if let Some(existing) = items.iter_mut().find(|p| p.id == change.id) {
                *existing = change.clone();
            }
        }
    }

    fn ordered_under(items: &[Placement], parent: Option<&str>) -> Vec<(String, i64)> {
        let mut under: Vec<_> = items
            .iter()
            .filter(|p| p.parent_id.as_deref() == parent)
            .map(|p| (p.id.clone(), p.order_index))
            .collect();
        under.sort_by_key(|(_, i)| *i);
        under
    }

    #[test]
    fn test_move_within_parent() {
        let mut items = vec![item("a", None, 0), item("b", None, 1), item("c", None, 2)];
        let plan = plan_reorder(&items, "c", None, 0).unwrap();

        // Only changed placements are returned
        assert_eq!(plan.len(), 3);
        apply(&mut items, &plan);
        assert_eq!(
            ordered_under(&items, None),
            vec![("c".to_string(), 0), ("a".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[test]
    fn test_move_into_folder_renumbers_both_parents() {
        let mut items = vec![
            item("folder", None, 0),
            item("a", None, 1),
            item("b", None, 2),
            item("x", Some("folder"), 0),
        ];
        let plan = plan_reorder(&items, "a", Some("folder"), 5).unwrap();
        apply(&mut items, &plan);

        assert_eq!(
            ordered_under(&items, Some("folder")),
            vec![("x".to_string(), 0), ("a".to_string(), 1)]
        );
        assert_eq!(
            ordered_under(&items, None),
            vec![("folder".to_string(), 0), ("b".to_string(), 1)]
        );
    }

    #[test]
    fn test_duplicate_indices_are_resolved() {
        let mut items = vec![item("a", None, 0), item("b", None, 0), item("c", None, 0)];
        let plan = plan_reorder(&items, "a", None, 2).unwrap();
        apply(&mut items, &plan);
        let indices: Vec<i64> = ordered_under(&items, None).into_iter().map(|(_, i)| i).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_rejects_cycles_and_unknown_items() {
        let items = vec![
            item("root", None, 0),
            item("child", Some("root"), 0),
            item("grandchild", Some("child"), 0),
        ];
        assert_eq!(
            plan_reorder(&items, "root", Some("grandchild"), 0),
            Err(ReorderError::Cycle("root".to_string()))
        );
        assert_eq!(
            plan_reorder(&items, "root", Some("root"), 0),
            Err(ReorderError::Cycle("root".to_string()))
        );
        assert_eq!(
            plan_reorder(&items, "ghost", None, 0),
            Err(ReorderError::UnknownItem("ghost".to_string()))
        );
        assert_eq!(
            plan_reorder(&items, "child", Some("ghost"), 0),
            Err(ReorderError::UnknownItem("ghost".to_string()))
        );
    }

    #[test]
    fn test_noop_move_plans_nothing() {
        let items = vec![item("a", None, 0), item("b", None, 1)];
        assert!(plan_reorder(&items, "b", None, 1).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_sibling_order_keys_strictly_increase(
            initial in proptest::collection::vec((any::<bool>(), 0i64..4), 2..8),
            moves in proptest::collection::vec(
                (any::<prop::sample::Index>(), any::<bool>(), 0usize..10),
                1..12,
            ),
        ) {
            let parent = |second: bool| if second { "q" } else { "p" };
            let mut items: Vec<Placement> = initial
                .iter()
                .enumerate()
                .map(|(i, (second, index))| item(&format!("i{}", i), Some(parent(*second)), *index))
                .collect();
            items.push(item("p", None, 0));
            items.push(item("q", None, 1));

            // Keys under a parent are only normalized once a move touches it
            let mut touched = std::collections::HashSet::new();
            for (pick, second, to) in moves {
                let moved = items[pick.index(initial.len())].clone();
                let destination = parent(second);
                let plan = plan_reorder(&items, &moved.id, Some(destination), to).unwrap();
                apply(&mut items, &plan);
                touched.insert(destination);
                touched.insert(parent(moved.parent_id.as_deref() == Some("q")));

                for under in &touched {
                    let indices: Vec<i64> = ordered_under(&items, Some(*under)).into_iter().map(|(_, i)| i).collect();
                    let expected: Vec<i64> = (0..indices.len() as i64).collect();
                    prop_assert_eq!(&indices, &expected, "order keys under {}", under);
                }

                let placed = ordered_under(&items, Some("p")).len() + ordered_under(&items, Some("q")).len();
                prop_assert_eq!(placed, initial.len());
                let landed = items.iter().find(|p| p.id == moved.id).unwrap();
                prop_assert_eq!(landed.parent_id.as_deref(), Some(destination));
            }
        }
    }
}
