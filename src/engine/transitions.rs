//! Order status state machine.
//!
//! The lifecycle is a single chain:
//! `Pendiente -> Asignado -> En camino al retiro -> Producto retirado -> Entregado`.
//! The timeout reclaimer's `Asignado -> Pendiente` reset bypasses this table.

use serde::Serialize;

use crate::error::OrderError;
use crate::models::order::{Order, OrderStatus};

pub fn allowed_successors(from: OrderStatus) -> &'static [OrderStatus] {
    match from {
        OrderStatus::Pending => &[OrderStatus::Assigned],
        OrderStatus::Assigned => &[OrderStatus::EnRouteToPickup],
        OrderStatus::EnRouteToPickup => &[OrderStatus::PickedUp],
        OrderStatus::PickedUp => &[OrderStatus::Delivered],
        OrderStatus::Delivered => &[],
    }
}

pub fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    allowed_successors(from).contains(&to)
}

/// The single successor of `current`, or `None` once delivered.
pub fn next_status(current: OrderStatus) -> Option<OrderStatus> {
    allowed_successors(current).first().copied()
}

pub fn requires_pickup_code(from: OrderStatus, to: OrderStatus) -> bool {
    from == OrderStatus::EnRouteToPickup && to == OrderStatus::PickedUp
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PrimaryAction {
    pub label: String,
    pub to_status: OrderStatus,
    pub requires_pickup_code: bool,
}

/// Next actionable step for an order card.
pub fn primary_action(order: &Order) -> Option<PrimaryAction> {
    let next = next_status(order.status)?;
    let label = if next == OrderStatus::Delivered {
        "Entregar pedido".to_string()
    } else {
        format!("Marcar como: {next}")
    };

    Some(PrimaryAction {
        label,
        to_status: next,
        requires_pickup_code: requires_pickup_code(order.status, next),
    })
}

/// Gate run before every status write.
pub fn validate_transition(order: &Order, to: OrderStatus) -> Result<(), OrderError> {
    if !can_transition(order.status, to) {
        return Err(OrderError::InvalidTransition {
            from: order.status,
            to,
        });
    }

    let has_code = order
        .pickup_code
        .as_deref()
        .is_some_and(|code| !code.trim().is_empty());
    if requires_pickup_code(order.status, to) && !has_code {
        return Err(OrderError::MissingPickupCode);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::fixtures::order;

    const EDGES: [(OrderStatus, OrderStatus); 4] = [
        (OrderStatus::Pending, OrderStatus::Assigned),
        (OrderStatus::Assigned, OrderStatus::EnRouteToPickup),
        (OrderStatus::EnRouteToPickup, OrderStatus::PickedUp),
        (OrderStatus::PickedUp, OrderStatus::Delivered),
    ];

    #[test]
    fn only_chain_edges_are_allowed() {
        for from in OrderStatus::ALL {
            for to in OrderStatus::ALL {
                let expected = EDGES.contains(&(from, to));
                assert_eq!(can_transition(from, to), expected, "{from} -> {to}");

                if !expected {
                    let current = order(1, from, Some(7));
                    let result = validate_transition(&current, to);
                    assert!(
                        matches!(result, Err(OrderError::InvalidTransition { .. })),
                        "{from} -> {to} should be rejected"
                    );
                }
            }
        }
    }

    #[test]
    fn every_non_terminal_status_has_exactly_one_successor() {
        for status in OrderStatus::ALL {
            let successors = allowed_successors(status);
            if status == OrderStatus::Delivered {
                assert!(successors.is_empty());
                assert_eq!(next_status(status), None);
            } else {
                assert_eq!(successors.len(), 1);
                assert_eq!(next_status(status), Some(successors[0]));
            }
        }
    }

    #[test]
    fn pickup_code_only_required_for_pickup() {
        for (from, to) in EDGES {
            let expected = from == OrderStatus::EnRouteToPickup;
            assert_eq!(requires_pickup_code(from, to), expected);
        }
    }

    #[test]
    fn pickup_without_configured_code_is_rejected() {
        for code in [None, Some(String::new()), Some("   ".to_string())] {
            let mut current = order(1, OrderStatus::EnRouteToPickup, Some(7));
            current.pickup_code = code;
            let result = validate_transition(&current, OrderStatus::PickedUp);
            assert!(matches!(result, Err(OrderError::MissingPickupCode)));
        }
    }

    #[test]
    fn missing_code_does_not_block_other_transitions() {
        let mut current = order(1, OrderStatus::Assigned, Some(7));
        current.pickup_code = None;
        assert!(validate_transition(&current, OrderStatus::EnRouteToPickup).is_ok());
    }

    #[test]
    fn primary_action_follows_next_status() {
        let en_route = order(1, OrderStatus::EnRouteToPickup, Some(7));
        let action = primary_action(&en_route).unwrap();
        assert_eq!(action.to_status, OrderStatus::PickedUp);
        assert!(action.requires_pickup_code);
        assert_eq!(action.label, "Marcar como: Producto retirado");

        let picked = order(1, OrderStatus::PickedUp, Some(7));
        assert_eq!(primary_action(&picked).unwrap().label, "Entregar pedido");

        let delivered = order(1, OrderStatus::Delivered, Some(7));
        assert!(primary_action(&delivered).is_none());
    }
}
