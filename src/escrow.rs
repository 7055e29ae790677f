//! Arbitrated bet escrow engine.
//!
//! Pure state machine for a two-party bet adjudicated by a third party. The
//! owner stakes value asserting a statement is true, an opponent matches the
//! stake betting it is false, and an arbiter votes before a deadline in
//! exchange for a fee, backed by a forfeitable penalty deposit.
//!
//! The engine never touches accounts or clocks. Every operation receives the
//! caller identity and the current unix time as explicit inputs, so the
//! whole lifecycle can be driven deterministically in tests.
//!
//! Guarantees:
//! 1. Terms lock as soon as the party relying on them commits value
//! 2. A stale `state_version` can never bind a confirming party
//! 3. Each role is paid at most once; flags commit before value moves
//! 4. Value paid out never exceeds value deposited
//! 5. A failed operation leaves the record untouched

use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Fixed-point scale of `fee_percent` (18 decimals).
pub const FEE_PERCENT_SCALE: u128 = 1_000_000_000_000_000_000;

/// Exclusive upper bound of `fee_percent` (100%).
pub const MAX_FEE_PERCENT: u128 = 100 * FEE_PERCENT_SCALE;

/// `fee = bet * fee_percent / FEE_DIVISOR` (percent scale times 100).
pub const FEE_DIVISOR: u128 = 100 * FEE_PERCENT_SCALE;

/// Largest stake whose fee product `bet * fee_percent` fits in a u128 for
/// every accepted `fee_percent`.
pub const MAX_STAKE: u128 = u128::MAX / MAX_FEE_PERCENT;

pub const MIN_ASSERTION_CHARS: usize = 3;
pub const MAX_ASSERTION_CHARS: usize = 400;

/// 32-byte participant identity.
pub type Address = [u8; 32];

/// Sentinel for a role that has not been bound yet.
pub const UNSET: Address = [0u8; 32];

// ============================================================================
// Errors
// ============================================================================

/// Error class of an [`EscrowError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wrong caller for the operation
    Authorization,
    /// Operation not valid in the current phase
    State,
    /// Malformed or mismatched value, time, percent or address
    Value,
    /// Stale state version supplied by a confirming party
    ConcurrencyConflict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum EscrowError {
    // Authorization
    #[error("caller is not the owner")]
    NotOwner,
    #[error("caller is not the arbiter")]
    NotArbiter,
    #[error("owner cannot bet against their own assertion")]
    OwnerCannotOppose,
    #[error("arbiter cannot bet on the assertion they judge")]
    ArbiterCannotOppose,
    #[error("caller is not the designated opponent")]
    NotDesignatedOpponent,
    #[error("caller has no role in this escrow")]
    UnknownCaller,

    // State
    #[error("escrow is closed")]
    Closed,
    #[error("owner stake already placed")]
    StakeAlreadyPlaced,
    #[error("owner stake not placed")]
    StakeNotPlaced,
    #[error("arbiter already confirmed")]
    ArbiterAlreadyConfirmed,
    #[error("arbiter not confirmed")]
    ArbiterNotConfirmed,
    #[error("opponent already confirmed")]
    OpponentAlreadyConfirmed,
    #[error("deadline has passed")]
    DeadlinePassed,
    #[error("settlement has already started")]
    SettlementStarted,
    #[error("voting window is not open")]
    VotingClosed,
    #[error("voting is in progress")]
    VotingInProgress,
    #[error("withdrawals open after a vote or after the deadline")]
    SettlementNotOpen,
    #[error("role already paid")]
    AlreadyPaid,
    #[error("verdict favours the opponent")]
    VerdictAgainstOwner,
    #[error("opponent has no payout pending")]
    NoOpponentPayout,
    #[error("opponent payout is still pending")]
    OpponentPayoutPending,
    #[error("payout exceeds vault balance")]
    VaultShortfall,

    // Concurrency
    #[error("state version does not match the agreed version")]
    StaleStateVersion,

    // Value
    #[error("assertion text length out of range")]
    InvalidAssertion,
    #[error("deadline must be in the future")]
    DeadlineNotInFuture,
    #[error("fee percent must be below 100%")]
    FeePercentOutOfRange,
    #[error("owner address must be set")]
    UnsetOwner,
    #[error("address collides with another role")]
    RoleCollision,
    #[error("address is unchanged")]
    AddressUnchanged,
    #[error("penalty amount is unchanged")]
    PenaltyUnchanged,
    #[error("stake must be positive")]
    ZeroStake,
    #[error("stake exceeds the largest settleable amount")]
    StakeTooLarge,
    #[error("deposit does not match the required amount")]
    DepositMismatch,
    #[error("arithmetic overflow")]
    Overflow,
}

impl EscrowError {
    pub fn kind(&self) -> ErrorKind {
        use EscrowError::*;
        match self {
            NotOwner | NotArbiter | OwnerCannotOppose | ArbiterCannotOppose
            | NotDesignatedOpponent | UnknownCaller => ErrorKind::Authorization,
            Closed | StakeAlreadyPlaced | StakeNotPlaced | ArbiterAlreadyConfirmed
            | ArbiterNotConfirmed | OpponentAlreadyConfirmed | DeadlinePassed
            | SettlementStarted | VotingClosed | VotingInProgress | SettlementNotOpen
            | AlreadyPaid | VerdictAgainstOwner | NoOpponentPayout | OpponentPayoutPending
            | VaultShortfall => ErrorKind::State,
            StaleStateVersion => ErrorKind::ConcurrencyConflict,
            InvalidAssertion | DeadlineNotInFuture | FeePercentOutOfRange | UnsetOwner
            | RoleCollision | AddressUnchanged | PenaltyUnchanged | ZeroStake
            | StakeTooLarge | DepositMismatch | Overflow => ErrorKind::Value,
        }
    }
}

pub type Result<T> = core::result::Result<T, EscrowError>;

// ============================================================================
// Core Data Structures
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Owner,
    Arbiter,
    Opponent,
}

/// The arbiter's single vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    AssertionTrue,
    AssertionFalse,
    /// No verdict reached: both stakes refunded, the arbiter forfeits the fee
    Unresolvable,
}

/// Validated creation tuple handed over by the deployment layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateParams {
    pub assertion: String,
    pub deadline: i64,
    pub fee_percent: u128,
    pub arbiter: Address,
    pub opponent: Address,
    pub penalty_amount: u128,
}

/// Value leaving the vault for one role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Payout {
    pub role: Role,
    pub amount: u128,
}

/// Result of closing the escrow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TeardownReceipt {
    /// Amount force-settled to the arbiter, if their claim was outstanding
    pub arbiter_payout: Option<u128>,
    /// Everything left in the vault, released to the owner
    pub owner_residual: u128,
}

/// The escrow record.
///
/// Fields are public for the account codec; all mutation goes through the
/// operations below, which validate every guard before the first write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Escrow {
    pub assertion: String,
    /// Unix seconds; voting must happen strictly before it
    pub deadline: i64,
    /// Arbiter fee, percent at `FEE_PERCENT_SCALE`
    pub fee_percent: u128,

    pub owner: Address,
    pub arbiter: Address,
    pub opponent: Address,

    /// Deposit the arbiter must lock to confirm
    pub penalty_amount: u128,
    /// Bumped on every term edit, checked by confirming parties
    pub state_version: u64,
    /// Owner stake, zero until placed
    pub bet_amount: u128,

    pub arbiter_confirmed: bool,
    pub opponent_confirmed: bool,

    pub arbiter_voted: bool,
    pub decision_made: bool,
    /// Only meaningful when `decision_made`
    pub assertion_true: bool,

    pub owner_paid: bool,
    pub arbiter_paid: bool,
    pub opponent_paid: bool,

    pub total_deposited: u128,
    pub total_withdrawn: u128,

    /// Terminal state set by teardown
    pub closed: bool,
}

fn validate_assertion(text: &str, min_chars: usize) -> Result<()> {
    let chars = text.chars().count();
    if chars < min_chars || chars > MAX_ASSERTION_CHARS {
        return Err(EscrowError::InvalidAssertion);
    }
    Ok(())
}

fn validate_fee_percent(fee_percent: u128) -> Result<()> {
    if fee_percent >= MAX_FEE_PERCENT {
        return Err(EscrowError::FeePercentOutOfRange);
    }
    Ok(())
}

fn validate_deadline(deadline: i64, now: i64) -> Result<()> {
    if deadline <= now {
        return Err(EscrowError::DeadlineNotInFuture);
    }
    Ok(())
}

impl Escrow {
    pub fn new(owner: Address, params: CreateParams, now: i64) -> Result<Self> {
        if owner == UNSET {
            return Err(EscrowError::UnsetOwner);
        }
        validate_assertion(&params.assertion, MIN_ASSERTION_CHARS)?;
        validate_deadline(params.deadline, now)?;
        validate_fee_percent(params.fee_percent)?;
        if params.arbiter == owner || params.opponent == owner {
            return Err(EscrowError::RoleCollision);
        }
        if params.arbiter != UNSET && params.arbiter == params.opponent {
            return Err(EscrowError::RoleCollision);
        }

        Ok(Self {
            assertion: params.assertion,
            deadline: params.deadline,
            fee_percent: params.fee_percent,
            owner,
            arbiter: params.arbiter,
            opponent: params.opponent,
            penalty_amount: params.penalty_amount,
            state_version: 0,
            bet_amount: 0,
            arbiter_confirmed: false,
            opponent_confirmed: false,
            arbiter_voted: false,
            decision_made: false,
            assertion_true: false,
            owner_paid: false,
            arbiter_paid: false,
            opponent_paid: false,
            total_deposited: 0,
            total_withdrawn: 0,
            closed: false,
        })
    }

    // ========================================
    // Guards
    // ========================================

    fn require_open(&self) -> Result<()> {
        if self.closed {
            return Err(EscrowError::Closed);
        }
        Ok(())
    }

    fn require_owner(&self, caller: &Address) -> Result<()> {
        if *caller != self.owner {
            return Err(EscrowError::NotOwner);
        }
        Ok(())
    }

    fn is_arbiter(&self, caller: &Address) -> bool {
        self.arbiter != UNSET && *caller == self.arbiter
    }

    fn is_opponent(&self, caller: &Address) -> bool {
        self.opponent != UNSET && *caller == self.opponent
    }

    fn require_arbiter(&self, caller: &Address) -> Result<()> {
        if !self.is_arbiter(caller) {
            return Err(EscrowError::NotArbiter);
        }
        Ok(())
    }

    fn require_arbiter_unconfirmed(&self) -> Result<()> {
        if self.arbiter_confirmed {
            return Err(EscrowError::ArbiterAlreadyConfirmed);
        }
        Ok(())
    }

    fn require_opponent_unconfirmed(&self) -> Result<()> {
        if self.opponent_confirmed {
            return Err(EscrowError::OpponentAlreadyConfirmed);
        }
        Ok(())
    }

    fn require_stake(&self) -> Result<()> {
        if self.bet_amount == 0 {
            return Err(EscrowError::StakeNotPlaced);
        }
        Ok(())
    }

    fn require_unsettled(&self) -> Result<()> {
        if self.owner_paid || self.arbiter_paid || self.opponent_paid {
            return Err(EscrowError::SettlementStarted);
        }
        Ok(())
    }

    fn require_version(&self, agreed_version: u64) -> Result<()> {
        if agreed_version != self.state_version {
            return Err(EscrowError::StaleStateVersion);
        }
        Ok(())
    }

    fn next_version(&self) -> Result<u64> {
        self.state_version.checked_add(1).ok_or(EscrowError::Overflow)
    }

    /// An address may not collide with the owner, nor with the other optional
    /// role unless it is being cleared.
    fn check_role_address(&self, addr: &Address, current: &Address, other: &Address) -> Result<()> {
        if addr == current {
            return Err(EscrowError::AddressUnchanged);
        }
        if *addr == self.owner || (*addr != UNSET && addr == other) {
            return Err(EscrowError::RoleCollision);
        }
        Ok(())
    }

    // ========================================
    // Term Registry
    // ========================================

    pub fn set_assertion(&mut self, caller: &Address, text: &str) -> Result<()> {
        self.require_open()?;
        self.require_owner(caller)?;
        if self.bet_amount != 0 {
            return Err(EscrowError::StakeAlreadyPlaced);
        }
        validate_assertion(text, 1)?;
        let version = self.next_version()?;

        self.assertion = String::from(text);
        self.state_version = version;
        Ok(())
    }

    pub fn set_deadline(&mut self, caller: &Address, deadline: i64, now: i64) -> Result<()> {
        self.require_open()?;
        self.require_owner(caller)?;
        self.require_arbiter_unconfirmed()?;
        validate_deadline(deadline, now)?;
        let version = self.next_version()?;

        self.deadline = deadline;
        self.state_version = version;
        Ok(())
    }

    pub fn set_fee_percent(&mut self, caller: &Address, fee_percent: u128) -> Result<()> {
        self.require_open()?;
        self.require_owner(caller)?;
        self.require_arbiter_unconfirmed()?;
        validate_fee_percent(fee_percent)?;
        let version = self.next_version()?;

        self.fee_percent = fee_percent;
        self.state_version = version;
        Ok(())
    }

    pub fn set_arbiter(&mut self, caller: &Address, arbiter: Address) -> Result<()> {
        self.require_open()?;
        self.require_owner(caller)?;
        self.require_arbiter_unconfirmed()?;
        self.check_role_address(&arbiter, &self.arbiter, &self.opponent)?;
        let version = self.next_version()?;

        self.arbiter = arbiter;
        self.state_version = version;
        Ok(())
    }

    pub fn set_opponent(&mut self, caller: &Address, opponent: Address) -> Result<()> {
        self.require_open()?;
        self.require_owner(caller)?;
        self.require_opponent_unconfirmed()?;
        self.check_role_address(&opponent, &self.opponent, &self.arbiter)?;
        let version = self.next_version()?;

        self.opponent = opponent;
        self.state_version = version;
        Ok(())
    }

    pub fn set_penalty_amount(&mut self, caller: &Address, amount: u128) -> Result<()> {
        self.require_open()?;
        self.require_owner(caller)?;
        self.require_arbiter_unconfirmed()?;
        if amount == self.penalty_amount {
            return Err(EscrowError::PenaltyUnchanged);
        }
        let version = self.next_version()?;

        self.penalty_amount = amount;
        self.state_version = version;
        Ok(())
    }

    // ========================================
    // Commitment Ledger
    // ========================================

    pub fn place_stake(&mut self, caller: &Address, value: u128) -> Result<()> {
        self.require_open()?;
        self.require_owner(caller)?;
        if self.bet_amount != 0 {
            return Err(EscrowError::StakeAlreadyPlaced);
        }
        if value == 0 {
            return Err(EscrowError::ZeroStake);
        }
        if value > MAX_STAKE {
            return Err(EscrowError::StakeTooLarge);
        }
        let deposited = self.total_deposited.checked_add(value).ok_or(EscrowError::Overflow)?;

        self.bet_amount = value;
        self.total_deposited = deposited;
        Ok(())
    }

    pub fn confirm_arbiter(&mut self, caller: &Address, agreed_version: u64, value: u128) -> Result<()> {
        self.require_open()?;
        self.require_arbiter(caller)?;
        self.require_arbiter_unconfirmed()?;
        self.require_stake()?;
        self.require_unsettled()?;
        self.require_version(agreed_version)?;
        if value != self.penalty_amount {
            return Err(EscrowError::DepositMismatch);
        }
        let deposited = self.total_deposited.checked_add(value).ok_or(EscrowError::Overflow)?;

        self.arbiter_confirmed = true;
        self.total_deposited = deposited;
        Ok(())
    }

    /// Arbiter walks away before the opponent commits. The penalty is
    /// refunded and zeroed; the owner must set a new one for the next arbiter.
    pub fn retreat_arbiter(&mut self, caller: &Address) -> Result<Payout> {
        self.require_open()?;
        self.require_arbiter(caller)?;
        if !self.arbiter_confirmed {
            return Err(EscrowError::ArbiterNotConfirmed);
        }
        self.require_opponent_unconfirmed()?;
        if self.arbiter_paid {
            return Err(EscrowError::AlreadyPaid);
        }
        let refund = self.penalty_amount;
        let withdrawn = self.checked_payout(refund)?;

        self.arbiter_confirmed = false;
        self.penalty_amount = 0;
        self.total_withdrawn = withdrawn;
        Ok(Payout { role: Role::Arbiter, amount: refund })
    }

    pub fn place_opponent_stake(
        &mut self,
        caller: &Address,
        agreed_version: u64,
        value: u128,
        now: i64,
    ) -> Result<()> {
        self.require_open()?;
        if *caller == UNSET {
            return Err(EscrowError::UnknownCaller);
        }
        if *caller == self.owner {
            return Err(EscrowError::OwnerCannotOppose);
        }
        if self.is_arbiter(caller) {
            return Err(EscrowError::ArbiterCannotOppose);
        }
        if self.opponent != UNSET && *caller != self.opponent {
            return Err(EscrowError::NotDesignatedOpponent);
        }
        self.require_stake()?;
        if !self.arbiter_confirmed {
            return Err(EscrowError::ArbiterNotConfirmed);
        }
        self.require_opponent_unconfirmed()?;
        self.require_unsettled()?;
        if now >= self.deadline {
            return Err(EscrowError::DeadlinePassed);
        }
        self.require_version(agreed_version)?;
        if value != self.bet_amount {
            return Err(EscrowError::DepositMismatch);
        }
        let deposited = self.total_deposited.checked_add(value).ok_or(EscrowError::Overflow)?;

        if self.opponent == UNSET {
            self.opponent = *caller;
        }
        self.opponent_confirmed = true;
        self.total_deposited = deposited;
        Ok(())
    }

    // ========================================
    // Arbitration Clock
    // ========================================

    pub fn voting_open(&self, now: i64) -> bool {
        self.arbiter_confirmed && self.opponent_confirmed && !self.arbiter_voted && now < self.deadline
    }

    /// The arbiter let the deadline pass without voting after both sides committed.
    pub fn arbiter_lazy(&self, now: i64) -> bool {
        self.opponent_confirmed && now > self.deadline && !self.arbiter_voted
    }

    /// Withdrawals open once a vote is cast or the deadline has passed.
    pub fn settlement_open(&self, now: i64) -> bool {
        self.arbiter_voted || now > self.deadline
    }

    // ========================================
    // Verdict Register
    // ========================================

    pub fn vote(&mut self, caller: &Address, verdict: Verdict, now: i64) -> Result<()> {
        self.require_open()?;
        self.require_arbiter(caller)?;
        if !self.voting_open(now) {
            return Err(EscrowError::VotingClosed);
        }

        self.arbiter_voted = true;
        match verdict {
            Verdict::AssertionTrue => {
                self.decision_made = true;
                self.assertion_true = true;
            }
            Verdict::AssertionFalse => {
                self.decision_made = true;
            }
            Verdict::Unresolvable => {}
        }
        Ok(())
    }

    pub fn vote_true(&mut self, caller: &Address, now: i64) -> Result<()> {
        self.vote(caller, Verdict::AssertionTrue, now)
    }

    pub fn vote_false(&mut self, caller: &Address, now: i64) -> Result<()> {
        self.vote(caller, Verdict::AssertionFalse, now)
    }

    pub fn vote_unresolvable(&mut self, caller: &Address, now: i64) -> Result<()> {
        self.vote(caller, Verdict::Unresolvable, now)
    }

    /// The recorded verdict, if the arbiter has voted.
    pub fn verdict(&self) -> Option<Verdict> {
        if !self.arbiter_voted {
            None
        } else if !self.decision_made {
            Some(Verdict::Unresolvable)
        } else if self.assertion_true {
            Some(Verdict::AssertionTrue)
        } else {
            Some(Verdict::AssertionFalse)
        }
    }

    // ========================================
    // Payout Calculator
    // ========================================

    /// Arbiter fee: `bet * fee_percent / 10^20`, truncated.
    pub fn fee_amount(&self) -> Result<u128> {
        self.bet_amount
            .checked_mul(self.fee_percent)
            .map(|v| v / FEE_DIVISOR)
            .ok_or(EscrowError::Overflow)
    }

    /// Both stakes minus the arbiter fee.
    pub fn winner_payout(&self) -> Result<u128> {
        let pot = self.bet_amount.checked_mul(2).ok_or(EscrowError::Overflow)?;
        pot.checked_sub(self.fee_amount()?).ok_or(EscrowError::Overflow)
    }

    /// Each bettor's share when the arbiter forfeits the penalty.
    fn lazy_split(&self) -> Result<u128> {
        self.bet_amount
            .checked_add(self.penalty_amount / 2)
            .ok_or(EscrowError::Overflow)
    }

    pub fn owner_payout(&self, now: i64) -> Result<u128> {
        if self.arbiter_lazy(now) && self.opponent_confirmed {
            return self.lazy_split();
        }
        if self.arbiter_voted && self.decision_made {
            return if self.assertion_true { self.winner_payout() } else { Ok(0) };
        }
        Ok(self.bet_amount)
    }

    pub fn opponent_payout(&self, now: i64) -> Result<u128> {
        if self.arbiter_lazy(now) {
            return self.lazy_split();
        }
        if self.arbiter_voted && self.decision_made {
            return if self.assertion_true { Ok(0) } else { self.winner_payout() };
        }
        Ok(if self.opponent_confirmed { self.bet_amount } else { 0 })
    }

    /// Arbiter entitlement as seen from the current state. Before a vote this
    /// includes the fee the arbiter stands to earn.
    pub fn arbiter_payout(&self, now: i64) -> Result<u128> {
        if self.arbiter_lazy(now) {
            return Ok(0);
        }
        let mut amount = 0u128;
        if !self.arbiter_voted || self.decision_made {
            amount = self.fee_amount()?;
        }
        if self.arbiter_confirmed {
            amount = amount.checked_add(self.penalty_amount).ok_or(EscrowError::Overflow)?;
        }
        Ok(amount)
    }

    /// What the arbiter withdrawal actually transfers: the penalty back if
    /// confirmed, plus the fee only once a decisive verdict exists.
    pub fn arbiter_settlement(&self, now: i64) -> Result<u128> {
        if self.arbiter_lazy(now) {
            return Ok(0);
        }
        let mut amount = if self.arbiter_confirmed { self.penalty_amount } else { 0 };
        if self.arbiter_voted && self.decision_made {
            amount = amount.checked_add(self.fee_amount()?).ok_or(EscrowError::Overflow)?;
        }
        Ok(amount)
    }

    pub fn opponent_payout_pending(&self, now: i64) -> bool {
        if self.opponent_paid {
            return false;
        }
        self.arbiter_lazy(now) || (self.arbiter_voted && !self.assertion_true)
    }

    // ========================================
    // Withdrawal Dispatcher
    // ========================================

    pub fn withdraw(&mut self, caller: &Address, now: i64) -> Result<Payout> {
        self.require_open()?;
        if !self.settlement_open(now) {
            return Err(EscrowError::SettlementNotOpen);
        }
        if self.is_arbiter(caller) {
            self.withdraw_arbiter(now)
        } else if *caller == self.owner {
            self.withdraw_owner(now)
        } else if self.is_opponent(caller) {
            self.withdraw_opponent(now)
        } else {
            Err(EscrowError::UnknownCaller)
        }
    }

    fn withdraw_arbiter(&mut self, now: i64) -> Result<Payout> {
        if self.arbiter_paid {
            return Err(EscrowError::AlreadyPaid);
        }
        let amount = self.arbiter_settlement(now)?;
        let withdrawn = self.checked_payout(amount)?;

        self.arbiter_paid = true;
        self.total_withdrawn = withdrawn;
        Ok(Payout { role: Role::Arbiter, amount })
    }

    fn withdraw_owner(&mut self, now: i64) -> Result<Payout> {
        if self.decision_made && !self.assertion_true {
            return Err(EscrowError::VerdictAgainstOwner);
        }
        if self.owner_paid {
            return Err(EscrowError::AlreadyPaid);
        }
        let amount = self.owner_payout(now)?;
        let withdrawn = self.checked_payout(amount)?;

        self.owner_paid = true;
        self.total_withdrawn = withdrawn;
        Ok(Payout { role: Role::Owner, amount })
    }

    fn withdraw_opponent(&mut self, now: i64) -> Result<Payout> {
        if !self.opponent_payout_pending(now) {
            return Err(if self.opponent_paid {
                EscrowError::AlreadyPaid
            } else {
                EscrowError::NoOpponentPayout
            });
        }
        let amount = self.opponent_payout(now)?;
        let withdrawn = self.checked_payout(amount)?;

        self.opponent_paid = true;
        self.total_withdrawn = withdrawn;
        Ok(Payout { role: Role::Opponent, amount })
    }

    /// New `total_withdrawn` after paying `amount`, refusing to dip below zero.
    fn checked_payout(&self, amount: u128) -> Result<u128> {
        if amount > self.vault_balance() {
            return Err(EscrowError::VaultShortfall);
        }
        self.total_withdrawn.checked_add(amount).ok_or(EscrowError::Overflow)
    }

    // ========================================
    // Teardown
    // ========================================

    /// Close the escrow. An outstanding arbiter claim is settled first; the
    /// rest of the vault goes to the owner.
    pub fn teardown(&mut self, caller: &Address, now: i64) -> Result<TeardownReceipt> {
        self.require_open()?;
        self.require_owner(caller)?;
        if self.voting_open(now) {
            return Err(EscrowError::VotingInProgress);
        }
        if self.opponent_payout_pending(now) {
            return Err(EscrowError::OpponentPayoutPending);
        }

        let arbiter_payout = if self.arbiter_confirmed && !self.arbiter_paid {
            Some(self.arbiter_settlement(now)?)
        } else {
            None
        };
        let withdrawn = self.checked_payout(arbiter_payout.unwrap_or(0))?;
        let owner_residual = self
            .total_deposited
            .checked_sub(withdrawn)
            .ok_or(EscrowError::Overflow)?;

        if arbiter_payout.is_some() {
            self.arbiter_paid = true;
        }
        self.total_withdrawn = self.total_deposited;
        self.closed = true;
        Ok(TeardownReceipt { arbiter_payout, owner_residual })
    }

    // ========================================
    // Accounting
    // ========================================

    pub fn vault_balance(&self) -> u128 {
        self.total_deposited.saturating_sub(self.total_withdrawn)
    }

    /// Everything still claimable by unpaid roles fits in the vault.
    pub fn check_conservation(&self, now: i64) -> bool {
        if self.total_withdrawn > self.total_deposited {
            return false;
        }
        if self.closed {
            return self.vault_balance() == 0;
        }

        let owner = if self.owner_paid { Ok(0) } else { self.owner_payout(now) };
        let opponent = if self.opponent_paid { Ok(0) } else { self.opponent_payout(now) };
        let arbiter = if self.arbiter_paid { Ok(0) } else { self.arbiter_settlement(now) };

        match (owner, opponent, arbiter) {
            (Ok(o), Ok(p), Ok(a)) => o
                .checked_add(p)
                .and_then(|s| s.checked_add(a))
                .map_or(false, |owed| owed <= self.vault_balance()),
            _ => false,
        }
    }
}
