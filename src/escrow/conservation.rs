//! Conservation checks between a vault and its outstanding claims.

use crate::error::EscrowError;
use crate::registry::Outcome;

use super::vault::EscrowVault;

/// Verify that escrowed collateral matches outstanding claims.
///
/// Before resolution every unit in the vault backs one YES and one NO claim.
/// After resolution the vault holds exactly what the winning side can still
/// redeem. Takes side totals rather than a ledger so staged changes can be
/// checked before they are applied.
pub fn verify_conservation(
    vault: &EscrowVault,
    total_yes: u64,
    total_no: u64,
    outcome: Option<Outcome>,
) -> Result<(), EscrowError> {
    let violated = |detail: String| EscrowError::ConservationViolated {
        event_id: vault.event_id().to_string(),
        detail,
    };

    let flows = vault
        .total_deposited()
        .checked_sub(vault.total_withdrawn())
        .ok_or_else(|| violated("withdrawn more than deposited".to_string()))?;
    if flows != vault.balance() {
        return Err(violated(format!(
            "balance {} != deposited {} - withdrawn {}",
            vault.balance(),
            vault.total_deposited(),
            vault.total_withdrawn()
        )));
    }

    match outcome {
        None => {
            if total_yes != vault.balance() || total_no != vault.balance() {
                return Err(violated(format!(
                    "balance {} but outstanding yes={} no={}",
                    vault.balance(),
                    total_yes,
                    total_no
                )));
            }
        }
        Some(winning) => {
            let payable = match winning {
                Outcome::Yes => total_yes,
                Outcome::No => total_no,
            };
            if payable != vault.balance() {
                return Err(violated(format!(
                    "balance {} but {} side can redeem {}",
                    vault.balance(),
                    winning,
                    payable
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AssetId;

    fn vault(amount: u64) -> EscrowVault {
        EscrowVault::new("E", AssetId::new("USDC").unwrap())
            .after_deposit(amount)
            .unwrap()
    }

    #[test]
    fn balanced_books_pass() {
        let vault = vault(1_000);
        assert!(verify_conservation(&vault, 1_000, 1_000, None).is_ok());
        assert!(verify_conservation(&vault, 1_000, 1_000, Some(Outcome::No)).is_ok());
    }

    #[test]
    fn redemption_keeps_winning_side_in_balance() {
        let vault = vault(1_000).after_withdraw(1_000).unwrap();

        assert!(verify_conservation(&vault, 0, 1_000, Some(Outcome::Yes)).is_ok());
        // The losing side still shows claims, so the unresolved rule no longer holds.
        assert!(verify_conservation(&vault, 0, 1_000, None).is_err());
    }

    #[test]
    fn unbacked_claims_are_detected() {
        let err = verify_conservation(&vault(100), 101, 101, None).unwrap_err();
        assert!(matches!(err, EscrowError::ConservationViolated { .. }));
    }

    #[test]
    fn broken_flow_identity_is_detected() {
        let tampered = EscrowVault::from_parts("E", AssetId::new("USDC").unwrap(), 50, 100, 0);
        let err = verify_conservation(&tampered, 50, 50, None).unwrap_err();
        assert!(matches!(err, EscrowError::ConservationViolated { detail, .. }
            if detail.contains("deposited")));
    }
}
