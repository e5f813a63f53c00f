//! Item status lifecycle: pending → preparing → ready → served.
//!
//! Transitions only ever move one step forward. Backward moves and skips are
//! rejected here, before any write, regardless of which surface asked.
//! Role-based capability checks plug in through [`CapabilityGate`] so the
//! host application decides who may advance what; the engine only enforces
//! that the decision happens before the mutation.

use serde::Serialize;

use crate::error::SyncError;
use crate::model::{ItemStatus, OrderItem};

impl ItemStatus {
    /// The single legal next status, if any. Served is terminal.
    pub fn next(self) -> Option<ItemStatus> {
        match self {
            ItemStatus::Pending => Some(ItemStatus::Preparing),
            ItemStatus::Preparing => Some(ItemStatus::Ready),
            ItemStatus::Ready => Some(ItemStatus::Served),
            ItemStatus::Served => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ItemStatus::Served
    }
}

/// Reject anything other than the single forward step.
pub fn validate_transition(from: ItemStatus, to: ItemStatus) -> Result<(), SyncError> {
    match from.next() {
        Some(next) if next == to => Ok(()),
        Some(_) => Err(SyncError::Transition(format!(
            "cannot move item from '{}' to '{}', only '{}' is allowed",
            from.as_str(),
            to.as_str(),
            from.next().map(|s| s.as_str()).unwrap_or("-"),
        ))),
        None => Err(SyncError::Transition(format!(
            "'{}' is terminal, item cannot change status",
            from.as_str()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Capability checks
// ---------------------------------------------------------------------------

/// Who is asking for a transition.
#[derive(Debug, Clone, Default)]
pub struct Actor {
    pub staff_id: Option<String>,
    pub role: String,
}

impl Actor {
    pub fn with_role(role: impl Into<String>) -> Actor {
        Actor {
            staff_id: None,
            role: role.into(),
        }
    }
}

/// Host-supplied policy deciding whether a role may perform a transition on
/// a given item. Consulted after structural validation, before any write.
pub trait CapabilityGate: Send + Sync {
    fn allows_item_transition(
        &self,
        actor: &Actor,
        item: &OrderItem,
        from: ItemStatus,
        to: ItemStatus,
    ) -> bool;
}

/// Default gate: every structurally valid transition is allowed.
pub struct AllowAll;

impl CapabilityGate for AllowAll {
    fn allows_item_transition(
        &self,
        _actor: &Actor,
        _item: &OrderItem,
        _from: ItemStatus,
        _to: ItemStatus,
    ) -> bool {
        true
    }
}

/// Validate the step structurally, then ask the gate.
pub fn authorize_transition(
    gate: &dyn CapabilityGate,
    actor: &Actor,
    item: &OrderItem,
    to: ItemStatus,
) -> Result<(), SyncError> {
    validate_transition(item.status, to)?;
    if !gate.allows_item_transition(actor, item, item.status, to) {
        return Err(SyncError::Permission(format!(
            "role '{}' may not move item '{}' from '{}' to '{}'",
            actor.role,
            item.name,
            item.status.as_str(),
            to.as_str()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Bulk transitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RejectedTransition {
    pub item_id: String,
    pub reason: String,
}

/// Outcome of planning a bulk advance: which items move and which were
/// denied. A partial rejection never blocks the permitted remainder.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkPlan {
    pub allowed: Vec<String>,
    pub rejected: Vec<RejectedTransition>,
}

impl BulkPlan {
    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty() && self.rejected.is_empty()
    }
}

/// Plan advancing every item currently in `from` to `to`. Items in other
/// statuses are simply not part of the bulk; items the gate denies land in
/// `rejected` with the reason.
pub fn plan_bulk_transition(
    gate: &dyn CapabilityGate,
    actor: &Actor,
    items: &[OrderItem],
    from: ItemStatus,
    to: ItemStatus,
) -> Result<BulkPlan, SyncError> {
    validate_transition(from, to)?;
    let mut plan = BulkPlan::default();
    for item in items.iter().filter(|i| i.status == from) {
        if gate.allows_item_transition(actor, item, from, to) {
            plan.allowed.push(item.id.clone());
        } else {
            plan.rejected.push(RejectedTransition {
                item_id: item.id.clone(),
                reason: format!(
                    "role '{}' may not move '{}' from '{}' to '{}'",
                    actor.role,
                    item.name,
                    from.as_str(),
                    to.as_str()
                ),
            });
        }
    }
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Kitchen board sections
// ---------------------------------------------------------------------------

/// Which kitchen board sections an order currently belongs to, derived from
/// its items' statuses alone. An order with items both preparing and ready
/// appears in both sections at once.
pub fn board_sections(items: &[OrderItem]) -> Vec<ItemStatus> {
    let mut sections: Vec<ItemStatus> = Vec::with_capacity(4);
    for status in [
        ItemStatus::Pending,
        ItemStatus::Preparing,
        ItemStatus::Ready,
        ItemStatus::Served,
    ] {
        if items.iter().any(|i| i.status == status) {
            sections.push(status);
        }
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ItemRef;

    fn item(id: &str, status: ItemStatus) -> OrderItem {
        OrderItem {
            id: id.to_string(),
            order_id: "o1".to_string(),
            item_ref: ItemRef::FoodItem("f1".to_string()),
            name: format!("Item {id}"),
            quantity: 1,
            unit_price: 5.0,
            subtotal: 5.0,
            variation: None,
            addons: vec![],
            special_instructions: None,
            status,
            created_at: "2026-08-22T10:00:00+00:00".to_string(),
            updated_at: "2026-08-22T10:00:00+00:00".to_string(),
        }
    }

    /// Gate that denies everything for the "waiter" role.
    struct KitchenOnly;
    impl CapabilityGate for KitchenOnly {
        fn allows_item_transition(
            &self,
            actor: &Actor,
            _item: &OrderItem,
            _from: ItemStatus,
            _to: ItemStatus,
        ) -> bool {
            actor.role != "waiter"
        }
    }

    #[test]
    fn test_only_single_forward_steps_are_valid() {
        assert!(validate_transition(ItemStatus::Pending, ItemStatus::Preparing).is_ok());
        assert!(validate_transition(ItemStatus::Preparing, ItemStatus::Ready).is_ok());
        assert!(validate_transition(ItemStatus::Ready, ItemStatus::Served).is_ok());

        // Skips and backward moves are rejected.
        assert!(matches!(
            validate_transition(ItemStatus::Pending, ItemStatus::Ready),
            Err(SyncError::Transition(_))
        ));
        assert!(matches!(
            validate_transition(ItemStatus::Served, ItemStatus::Preparing),
            Err(SyncError::Transition(_))
        ));
        assert!(matches!(
            validate_transition(ItemStatus::Ready, ItemStatus::Preparing),
            Err(SyncError::Transition(_))
        ));
    }

    #[test]
    fn test_served_is_terminal() {
        assert!(ItemStatus::Served.is_terminal());
        assert_eq!(ItemStatus::Served.next(), None);
        let err = validate_transition(ItemStatus::Served, ItemStatus::Served).unwrap_err();
        assert!(err.to_string().contains("terminal"));
    }

    #[test]
    fn test_gate_denial_is_a_permission_error() {
        let subject = item("i1", ItemStatus::Pending);
        let waiter = Actor::with_role("waiter");
        let err =
            authorize_transition(&KitchenOnly, &waiter, &subject, ItemStatus::Preparing)
                .unwrap_err();
        assert!(matches!(err, SyncError::Permission(_)));

        let chef = Actor::with_role("chef");
        assert!(authorize_transition(&KitchenOnly, &chef, &subject, ItemStatus::Preparing).is_ok());
    }

    #[test]
    fn test_structural_check_runs_before_gate() {
        // Even an allowed role cannot skip a step.
        let subject = item("i1", ItemStatus::Pending);
        let chef = Actor::with_role("chef");
        let err = authorize_transition(&KitchenOnly, &chef, &subject, ItemStatus::Served)
            .unwrap_err();
        assert!(matches!(err, SyncError::Transition(_)));
    }

    #[test]
    fn test_bulk_plan_partitions_allowed_and_rejected() {
        struct DenyCombos;
        impl CapabilityGate for DenyCombos {
            fn allows_item_transition(
                &self,
                _actor: &Actor,
                item: &OrderItem,
                _from: ItemStatus,
                _to: ItemStatus,
            ) -> bool {
                !item.name.contains("Combo")
            }
        }

        let mut combo = item("i2", ItemStatus::Preparing);
        combo.name = "Combo Set".to_string();
        let items = vec![
            item("i1", ItemStatus::Preparing),
            combo,
            item("i3", ItemStatus::Ready), // not in the source status
        ];
        let plan = plan_bulk_transition(
            &DenyCombos,
            &Actor::with_role("chef"),
            &items,
            ItemStatus::Preparing,
            ItemStatus::Ready,
        )
        .unwrap();

        assert_eq!(plan.allowed, vec!["i1".to_string()]);
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].item_id, "i2");
    }

    #[test]
    fn test_bulk_plan_rejects_invalid_step_outright() {
        let items = vec![item("i1", ItemStatus::Pending)];
        let err = plan_bulk_transition(
            &AllowAll,
            &Actor::default(),
            &items,
            ItemStatus::Pending,
            ItemStatus::Served,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Transition(_)));
    }

    #[test]
    fn test_board_sections_derive_from_items_only() {
        let items = vec![
            item("i1", ItemStatus::Preparing),
            item("i2", ItemStatus::Ready),
            item("i3", ItemStatus::Preparing),
        ];
        assert_eq!(
            board_sections(&items),
            vec![ItemStatus::Preparing, ItemStatus::Ready]
        );
        assert!(board_sections(&[]).is_empty());
    }
}
