//! BetMe: single-file Solana program wrapping the arbitrated bet escrow engine.

#![deny(unsafe_code)]

pub mod escrow;

// 1. mod constants
pub mod constants {
    use core::mem::size_of;
    use crate::state::EscrowRecord;

    pub use crate::escrow::{
        FEE_DIVISOR, FEE_PERCENT_SCALE, MAX_ASSERTION_CHARS, MAX_FEE_PERCENT, MIN_ASSERTION_CHARS,
    };

    pub const MAGIC: u64 = 0x4245544d45455343; // "BETMEESC"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = 64;

    /// Assertion storage in bytes: the longest allowed text in 4-byte UTF-8.
    pub const ASSERTION_CAP: usize = MAX_ASSERTION_CHARS * 4;

    pub const RECORD_OFF: usize = HEADER_LEN;
    pub const RECORD_LEN: usize = size_of::<EscrowRecord>();
    pub const ESCROW_LEN: usize = RECORD_OFF + RECORD_LEN;
}

// 2. mod error
pub mod error {
    use num_derive::FromPrimitive;
    use num_traits::FromPrimitive;
    use solana_program::{
        decode_error::DecodeError,
        msg,
        program_error::{PrintProgramError, ProgramError},
    };
    use thiserror::Error;
    use crate::escrow::EscrowError;

    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error, FromPrimitive)]
    pub enum BetmeError {
        #[error("Escrow account has an unknown magic")]
        InvalidMagic,
        #[error("Escrow account layout version mismatch")]
        InvalidVersion,
        #[error("Escrow already initialized")]
        AlreadyInitialized,
        #[error("Escrow not initialized")]
        NotInitialized,
        #[error("Escrow account has the wrong size")]
        InvalidEscrowLen,
        #[error("Expected signer")]
        ExpectedSigner,
        #[error("Expected writable account")]
        ExpectedWritable,
        #[error("Assertion is not valid UTF-8 or too long")]
        InvalidAssertionEncoding,
        #[error("Amount does not fit in lamports")]
        LamportOverflow,
        // Engine errors mapped:
        #[error("Caller is not the owner")]
        EngineNotOwner,
        #[error("Caller is not the arbiter")]
        EngineNotArbiter,
        #[error("Owner cannot take the opponent side")]
        EngineOwnerCannotOppose,
        #[error("Arbiter cannot take the opponent side")]
        EngineArbiterCannotOppose,
        #[error("Caller is not the designated opponent")]
        EngineNotDesignatedOpponent,
        #[error("Caller has no role in this escrow")]
        EngineUnknownCaller,
        #[error("Escrow is closed")]
        EngineClosed,
        #[error("Stake already placed")]
        EngineStakeAlreadyPlaced,
        #[error("Stake not placed")]
        EngineStakeNotPlaced,
        #[error("Arbiter already confirmed")]
        EngineArbiterAlreadyConfirmed,
        #[error("Arbiter not confirmed")]
        EngineArbiterNotConfirmed,
        #[error("Opponent already confirmed")]
        EngineOpponentAlreadyConfirmed,
        #[error("Deadline has passed")]
        EngineDeadlinePassed,
        #[error("Settlement has started")]
        EngineSettlementStarted,
        #[error("Voting window is not open")]
        EngineVotingClosed,
        #[error("Voting is in progress")]
        EngineVotingInProgress,
        #[error("Settlement is not open yet")]
        EngineSettlementNotOpen,
        #[error("Already paid")]
        EngineAlreadyPaid,
        #[error("Verdict favours the opponent")]
        EngineVerdictAgainstOwner,
        #[error("No opponent payout pending")]
        EngineNoOpponentPayout,
        #[error("Opponent payout still pending")]
        EngineOpponentPayoutPending,
        #[error("Vault balance too low")]
        EngineVaultShortfall,
        #[error("Stale state version")]
        EngineStaleStateVersion,
        #[error("Invalid assertion")]
        EngineInvalidAssertion,
        #[error("Deadline must be in the future")]
        EngineDeadlineNotInFuture,
        #[error("Fee percent out of range")]
        EngineFeePercentOutOfRange,
        #[error("Owner must be set")]
        EngineUnsetOwner,
        #[error("Role address collision")]
        EngineRoleCollision,
        #[error("Address unchanged")]
        EngineAddressUnchanged,
        #[error("Penalty unchanged")]
        EnginePenaltyUnchanged,
        #[error("Stake must be positive")]
        EngineZeroStake,
        #[error("Deposit mismatch")]
        EngineDepositMismatch,
        #[error("Arithmetic overflow")]
        EngineOverflow,
        #[error("Stake too large to settle")]
        EngineStakeTooLarge,
    }

    impl From<BetmeError> for ProgramError {
        fn from(e: BetmeError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    impl<T> DecodeError<T> for BetmeError {
        fn type_of() -> &'static str {
            "BetmeError"
        }
    }

    impl PrintProgramError for BetmeError {
        fn print<E>(&self)
        where
            E: 'static + std::error::Error + DecodeError<E> + PrintProgramError + FromPrimitive,
        {
            msg!("Error: {}", self);
        }
    }

    pub fn map_escrow_error(e: EscrowError) -> ProgramError {
        let err = match e {
            EscrowError::NotOwner => BetmeError::EngineNotOwner,
            EscrowError::NotArbiter => BetmeError::EngineNotArbiter,
            EscrowError::OwnerCannotOppose => BetmeError::EngineOwnerCannotOppose,
            EscrowError::ArbiterCannotOppose => BetmeError::EngineArbiterCannotOppose,
            EscrowError::NotDesignatedOpponent => BetmeError::EngineNotDesignatedOpponent,
            EscrowError::UnknownCaller => BetmeError::EngineUnknownCaller,
            EscrowError::Closed => BetmeError::EngineClosed,
            EscrowError::StakeAlreadyPlaced => BetmeError::EngineStakeAlreadyPlaced,
            EscrowError::StakeNotPlaced => BetmeError::EngineStakeNotPlaced,
            EscrowError::ArbiterAlreadyConfirmed => BetmeError::EngineArbiterAlreadyConfirmed,
            EscrowError::ArbiterNotConfirmed => BetmeError::EngineArbiterNotConfirmed,
            EscrowError::OpponentAlreadyConfirmed => BetmeError::EngineOpponentAlreadyConfirmed,
            EscrowError::DeadlinePassed => BetmeError::EngineDeadlinePassed,
            EscrowError::SettlementStarted => BetmeError::EngineSettlementStarted,
            EscrowError::VotingClosed => BetmeError::EngineVotingClosed,
            EscrowError::VotingInProgress => BetmeError::EngineVotingInProgress,
            EscrowError::SettlementNotOpen => BetmeError::EngineSettlementNotOpen,
            EscrowError::AlreadyPaid => BetmeError::EngineAlreadyPaid,
            EscrowError::VerdictAgainstOwner => BetmeError::EngineVerdictAgainstOwner,
            EscrowError::NoOpponentPayout => BetmeError::EngineNoOpponentPayout,
            EscrowError::OpponentPayoutPending => BetmeError::EngineOpponentPayoutPending,
            EscrowError::VaultShortfall => BetmeError::EngineVaultShortfall,
            EscrowError::StaleStateVersion => BetmeError::EngineStaleStateVersion,
            EscrowError::InvalidAssertion => BetmeError::EngineInvalidAssertion,
            EscrowError::DeadlineNotInFuture => BetmeError::EngineDeadlineNotInFuture,
            EscrowError::FeePercentOutOfRange => BetmeError::EngineFeePercentOutOfRange,
            EscrowError::UnsetOwner => BetmeError::EngineUnsetOwner,
            EscrowError::RoleCollision => BetmeError::EngineRoleCollision,
            EscrowError::AddressUnchanged => BetmeError::EngineAddressUnchanged,
            EscrowError::PenaltyUnchanged => BetmeError::EnginePenaltyUnchanged,
            EscrowError::ZeroStake => BetmeError::EngineZeroStake,
            EscrowError::StakeTooLarge => BetmeError::EngineStakeTooLarge,
            EscrowError::DepositMismatch => BetmeError::EngineDepositMismatch,
            EscrowError::Overflow => BetmeError::EngineOverflow,
        };
        ProgramError::Custom(err as u32)
    }
}

// 3. mod ix (array_ref! expands to a pointer cast)
#[allow(unsafe_code)]
pub mod ix {
    use arrayref::array_ref;
    use solana_program::{program_error::ProgramError, pubkey::Pubkey};
    use crate::{constants::ASSERTION_CAP, error::BetmeError};

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Instruction {
        InitEscrow {
            deadline: i64,
            fee_percent: u128,
            arbiter: Pubkey,
            opponent: Pubkey,
            penalty_amount: u64,
            assertion: String,
        },
        SetAssertion { assertion: String },
        SetDeadline { deadline: i64 },
        SetFeePercent { fee_percent: u128 },
        SetArbiter { arbiter: Pubkey },
        SetOpponent { opponent: Pubkey },
        SetPenaltyAmount { amount: u64 },
        PlaceStake { amount: u64 },
        ConfirmArbiter { agreed_version: u64, deposit: u64 },
        RetreatArbiter,
        PlaceOpponentStake { agreed_version: u64, deposit: u64 },
        VoteTrue,
        VoteFalse,
        VoteUnresolvable,
        Withdraw,
        Teardown,
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => {
                    let deadline = read_i64(&mut rest)?;
                    let fee_percent = read_u128(&mut rest)?;
                    let arbiter = read_pubkey(&mut rest)?;
                    let opponent = read_pubkey(&mut rest)?;
                    let penalty_amount = read_u64(&mut rest)?;
                    let assertion = read_assertion(&mut rest)?;
                    Ok(Instruction::InitEscrow {
                        deadline, fee_percent, arbiter, opponent, penalty_amount, assertion,
                    })
                },
                1 => Ok(Instruction::SetAssertion { assertion: read_assertion(&mut rest)? }),
                2 => Ok(Instruction::SetDeadline { deadline: read_i64(&mut rest)? }),
                3 => Ok(Instruction::SetFeePercent { fee_percent: read_u128(&mut rest)? }),
                4 => Ok(Instruction::SetArbiter { arbiter: read_pubkey(&mut rest)? }),
                5 => Ok(Instruction::SetOpponent { opponent: read_pubkey(&mut rest)? }),
                6 => Ok(Instruction::SetPenaltyAmount { amount: read_u64(&mut rest)? }),
                7 => Ok(Instruction::PlaceStake { amount: read_u64(&mut rest)? }),
                8 => {
                    let agreed_version = read_u64(&mut rest)?;
                    let deposit = read_u64(&mut rest)?;
                    Ok(Instruction::ConfirmArbiter { agreed_version, deposit })
                },
                9 => Ok(Instruction::RetreatArbiter),
                10 => {
                    let agreed_version = read_u64(&mut rest)?;
                    let deposit = read_u64(&mut rest)?;
                    Ok(Instruction::PlaceOpponentStake { agreed_version, deposit })
                },
                11 => Ok(Instruction::VoteTrue),
                12 => Ok(Instruction::VoteFalse),
                13 => Ok(Instruction::VoteUnresolvable),
                14 => Ok(Instruction::Withdraw),
                15 => Ok(Instruction::Teardown),
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }

        /// Client-side encoding, the inverse of [`Instruction::decode`].
        pub fn pack(&self) -> Result<Vec<u8>, ProgramError> {
            let mut buf = Vec::new();
            match self {
                Instruction::InitEscrow {
                    deadline, fee_percent, arbiter, opponent, penalty_amount, assertion,
                } => {
                    buf.push(0);
                    buf.extend_from_slice(&deadline.to_le_bytes());
                    buf.extend_from_slice(&fee_percent.to_le_bytes());
                    buf.extend_from_slice(arbiter.as_ref());
                    buf.extend_from_slice(opponent.as_ref());
                    buf.extend_from_slice(&penalty_amount.to_le_bytes());
                    write_assertion(assertion, &mut buf)?;
                },
                Instruction::SetAssertion { assertion } => {
                    buf.push(1);
                    write_assertion(assertion, &mut buf)?;
                },
                Instruction::SetDeadline { deadline } => {
                    buf.push(2);
                    buf.extend_from_slice(&deadline.to_le_bytes());
                },
                Instruction::SetFeePercent { fee_percent } => {
                    buf.push(3);
                    buf.extend_from_slice(&fee_percent.to_le_bytes());
                },
                Instruction::SetArbiter { arbiter } => {
                    buf.push(4);
                    buf.extend_from_slice(arbiter.as_ref());
                },
                Instruction::SetOpponent { opponent } => {
                    buf.push(5);
                    buf.extend_from_slice(opponent.as_ref());
                },
                Instruction::SetPenaltyAmount { amount } => {
                    buf.push(6);
                    buf.extend_from_slice(&amount.to_le_bytes());
                },
                Instruction::PlaceStake { amount } => {
                    buf.push(7);
                    buf.extend_from_slice(&amount.to_le_bytes());
                },
                Instruction::ConfirmArbiter { agreed_version, deposit } => {
                    buf.push(8);
                    buf.extend_from_slice(&agreed_version.to_le_bytes());
                    buf.extend_from_slice(&deposit.to_le_bytes());
                },
                Instruction::RetreatArbiter => buf.push(9),
                Instruction::PlaceOpponentStake { agreed_version, deposit } => {
                    buf.push(10);
                    buf.extend_from_slice(&agreed_version.to_le_bytes());
                    buf.extend_from_slice(&deposit.to_le_bytes());
                },
                Instruction::VoteTrue => buf.push(11),
                Instruction::VoteFalse => buf.push(12),
                Instruction::VoteUnresolvable => buf.push(13),
                Instruction::Withdraw => buf.push(14),
                Instruction::Teardown => buf.push(15),
            }
            Ok(buf)
        }
    }

    fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProgramError> {
        let current: &'a [u8] = *input;
        if current.len() < n { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = current.split_at(n);
        *input = rest;
        Ok(bytes)
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        let bytes = take(input, 2)?;
        Ok(u16::from_le_bytes(*array_ref![bytes, 0, 2]))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        let bytes = take(input, 8)?;
        Ok(u64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    fn read_i64(input: &mut &[u8]) -> Result<i64, ProgramError> {
        let bytes = take(input, 8)?;
        Ok(i64::from_le_bytes(*array_ref![bytes, 0, 8]))
    }

    fn read_u128(input: &mut &[u8]) -> Result<u128, ProgramError> {
        let bytes = take(input, 16)?;
        Ok(u128::from_le_bytes(*array_ref![bytes, 0, 16]))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        let bytes = take(input, 32)?;
        Ok(Pubkey::new_from_array(*array_ref![bytes, 0, 32]))
    }

    /// `u16` byte length followed by UTF-8 text.
    fn read_assertion(input: &mut &[u8]) -> Result<String, ProgramError> {
        let len = read_u16(input)? as usize;
        if len > ASSERTION_CAP {
            return Err(BetmeError::InvalidAssertionEncoding.into());
        }
        let bytes = take(input, len)?;
        let text = core::str::from_utf8(bytes)
            .map_err(|_| ProgramError::from(BetmeError::InvalidAssertionEncoding))?;
        Ok(String::from(text))
    }

    fn write_assertion(text: &str, buf: &mut Vec<u8>) -> Result<(), ProgramError> {
        let bytes = text.as_bytes();
        if bytes.len() > ASSERTION_CAP {
            return Err(BetmeError::InvalidAssertionEncoding.into());
        }
        let len = u16::try_from(bytes.len())
            .map_err(|_| ProgramError::from(BetmeError::InvalidAssertionEncoding))?;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(bytes);
        Ok(())
    }
}

// 4. mod accounts
pub mod accounts {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};
    use crate::error::BetmeError;

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(BetmeError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(BetmeError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }
}

// 5. mod state
pub mod state {
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};
    use crate::constants::{ASSERTION_CAP, HEADER_LEN, MAGIC, RECORD_LEN, RECORD_OFF, VERSION};
    use crate::error::BetmeError;
    use crate::escrow::Escrow;

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct EscrowHeader {
        pub magic: u64,
        pub version: u32,
        pub _padding: [u8; 4],
        pub owner: [u8; 32],
        pub _reserved: [u8; 16],
    }

    /// On-account form of [`Escrow`]. Amounts are lamports; flags are 0/1.
    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct EscrowRecord {
        pub arbiter: [u8; 32],
        pub opponent: [u8; 32],
        pub deadline: i64,
        /// u128 little-endian, kept as bytes to hold 8-byte alignment
        pub fee_percent: [u8; 16],
        pub penalty_amount: u64,
        pub state_version: u64,
        pub bet_amount: u64,
        pub total_deposited: u64,
        pub total_withdrawn: u64,
        pub arbiter_confirmed: u8,
        pub opponent_confirmed: u8,
        pub arbiter_voted: u8,
        pub decision_made: u8,
        pub assertion_true: u8,
        pub owner_paid: u8,
        pub arbiter_paid: u8,
        pub opponent_paid: u8,
        pub closed: u8,
        pub _padding0: u8,
        pub assertion_len: u16,
        pub _padding1: [u8; 4],
        pub assertion: [u8; ASSERTION_CAP],
    }

    pub fn escrow_data_mut<'a, 'b>(ai: &'b AccountInfo<'a>) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> EscrowHeader {
        let mut h = EscrowHeader::zeroed();
        let src = &data[..HEADER_LEN];
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(src);
        h
    }

    pub fn write_header(data: &mut [u8], h: &EscrowHeader) {
        let src = bytemuck::bytes_of(h);
        let dst = &mut data[..HEADER_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_record(data: &[u8]) -> EscrowRecord {
        let mut r = EscrowRecord::zeroed();
        let src = &data[RECORD_OFF..RECORD_OFF + RECORD_LEN];
        let dst = bytemuck::bytes_of_mut(&mut r);
        dst.copy_from_slice(src);
        r
    }

    pub fn write_record(data: &mut [u8], r: &EscrowRecord) {
        let src = bytemuck::bytes_of(r);
        let dst = &mut data[RECORD_OFF..RECORD_OFF + RECORD_LEN];
        dst.copy_from_slice(src);
    }

    fn to_lamports(v: u128) -> Result<u64, ProgramError> {
        u64::try_from(v).map_err(|_| BetmeError::LamportOverflow.into())
    }

    pub fn pack_record(e: &Escrow) -> Result<EscrowRecord, ProgramError> {
        let text = e.assertion.as_bytes();
        if text.len() > ASSERTION_CAP {
            return Err(BetmeError::InvalidAssertionEncoding.into());
        }

        let mut r = EscrowRecord::zeroed();
        r.arbiter = e.arbiter;
        r.opponent = e.opponent;
        r.deadline = e.deadline;
        r.fee_percent = e.fee_percent.to_le_bytes();
        r.penalty_amount = to_lamports(e.penalty_amount)?;
        r.state_version = e.state_version;
        r.bet_amount = to_lamports(e.bet_amount)?;
        r.total_deposited = to_lamports(e.total_deposited)?;
        r.total_withdrawn = to_lamports(e.total_withdrawn)?;
        r.arbiter_confirmed = e.arbiter_confirmed as u8;
        r.opponent_confirmed = e.opponent_confirmed as u8;
        r.arbiter_voted = e.arbiter_voted as u8;
        r.decision_made = e.decision_made as u8;
        r.assertion_true = e.assertion_true as u8;
        r.owner_paid = e.owner_paid as u8;
        r.arbiter_paid = e.arbiter_paid as u8;
        r.opponent_paid = e.opponent_paid as u8;
        r.closed = e.closed as u8;
        r.assertion_len = text.len() as u16; // ASSERTION_CAP < u16::MAX
        r.assertion[..text.len()].copy_from_slice(text);
        Ok(r)
    }

    pub fn unpack_record(owner: [u8; 32], r: &EscrowRecord) -> Result<Escrow, ProgramError> {
        let len = r.assertion_len as usize;
        if len > ASSERTION_CAP {
            return Err(BetmeError::InvalidAssertionEncoding.into());
        }
        let assertion = core::str::from_utf8(&r.assertion[..len])
            .map_err(|_| ProgramError::from(BetmeError::InvalidAssertionEncoding))?;

        Ok(Escrow {
            assertion: String::from(assertion),
            deadline: r.deadline,
            fee_percent: u128::from_le_bytes(r.fee_percent),
            owner,
            arbiter: r.arbiter,
            opponent: r.opponent,
            penalty_amount: u128::from(r.penalty_amount),
            state_version: r.state_version,
            bet_amount: u128::from(r.bet_amount),
            arbiter_confirmed: r.arbiter_confirmed != 0,
            opponent_confirmed: r.opponent_confirmed != 0,
            arbiter_voted: r.arbiter_voted != 0,
            decision_made: r.decision_made != 0,
            assertion_true: r.assertion_true != 0,
            owner_paid: r.owner_paid != 0,
            arbiter_paid: r.arbiter_paid != 0,
            opponent_paid: r.opponent_paid != 0,
            total_deposited: u128::from(r.total_deposited),
            total_withdrawn: u128::from(r.total_withdrawn),
            closed: r.closed != 0,
        })
    }

    pub fn read_escrow(data: &[u8]) -> Result<Escrow, ProgramError> {
        let h = read_header(data);
        unpack_record(h.owner, &read_record(data))
    }

    /// Writes the header and record. Nothing is written if the record does
    /// not fit the account layout.
    pub fn write_escrow(data: &mut [u8], e: &Escrow) -> Result<(), ProgramError> {
        let record = pack_record(e)?;
        let header = EscrowHeader {
            magic: MAGIC,
            version: VERSION,
            _padding: [0; 4],
            owner: e.owner,
            _reserved: [0; 16],
        };
        write_header(data, &header);
        write_record(data, &record);
        Ok(())
    }
}

// 6. mod lamports
pub mod lamports {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};
    use crate::error::BetmeError;

    #[cfg(not(test))]
    use solana_program::{program::invoke, system_instruction};

    /// Move `amount` from a system-owned payer into the escrow account.
    pub fn deposit<'a>(
        _system_program: &AccountInfo<'a>,
        payer: &AccountInfo<'a>,
        escrow: &AccountInfo<'a>,
        amount: u64,
    ) -> Result<(), ProgramError> {
        if amount == 0 {
            return Ok(());
        }
        #[cfg(not(test))]
        {
            let ix = system_instruction::transfer(payer.key, escrow.key, amount);
            invoke(&ix, &[payer.clone(), escrow.clone(), _system_program.clone()])
        }
        #[cfg(test)]
        {
            move_lamports(payer, escrow, amount)
        }
    }

    /// Debit the program-owned escrow account directly.
    pub fn pay_out(escrow: &AccountInfo, dest: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
        if amount == 0 {
            return Ok(());
        }
        move_lamports(escrow, dest, amount)
    }

    /// Drain every lamport, rent included, into `dest`.
    pub fn sweep(escrow: &AccountInfo, dest: &AccountInfo) -> Result<u64, ProgramError> {
        let amount = escrow.lamports();
        pay_out(escrow, dest, amount)?;
        Ok(amount)
    }

    fn move_lamports(from: &AccountInfo, to: &AccountInfo, amount: u64) -> Result<(), ProgramError> {
        let mut src = from.try_borrow_mut_lamports()?;
        let mut dst = to.try_borrow_mut_lamports()?;
        let debited = (**src).checked_sub(amount).ok_or(ProgramError::InsufficientFunds)?;
        let credited = (**dst).checked_add(amount).ok_or(BetmeError::LamportOverflow)?;
        **src = debited;
        **dst = credited;
        Ok(())
    }
}

// 7. mod processor
pub mod processor {
    use solana_program::{
        account_info::AccountInfo, entrypoint::ProgramResult, msg, pubkey::Pubkey,
        system_program,
        sysvar::{clock::Clock, Sysvar},
        program_error::ProgramError,
    };
    use crate::{
        accounts,
        constants::{ESCROW_LEN, MAGIC, VERSION},
        error::{map_escrow_error, BetmeError},
        escrow::{Address, CreateParams, Escrow, Payout, Role},
        ix::Instruction,
        lamports,
        state,
    };

    fn escrow_guard(program_id: &Pubkey, escrow: &AccountInfo) -> Result<(), ProgramError> {
        accounts::expect_owner(escrow, program_id)?;
        if escrow.data_len() != ESCROW_LEN { return Err(BetmeError::InvalidEscrowLen.into()); }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic == 0 { return Err(BetmeError::NotInitialized.into()); }
        if h.magic != MAGIC { return Err(BetmeError::InvalidMagic.into()); }
        if h.version != VERSION { return Err(BetmeError::InvalidVersion.into()); }
        Ok(())
    }

    fn unix_now(clock: &AccountInfo) -> Result<i64, ProgramError> {
        Ok(Clock::from_account_info(clock)?.unix_timestamp)
    }

    fn caller(accounts: &[AccountInfo]) -> Address {
        accounts[0].key.to_bytes()
    }

    /// Validates `[caller (signer), escrow (writable), clock, ..]` and loads
    /// the record with the current unix time.
    fn open_escrow(program_id: &Pubkey, accounts: &[AccountInfo], n: usize) -> Result<(Escrow, i64), ProgramError> {
        accounts::expect_len(accounts, n)?;
        accounts::expect_signer(&accounts[0])?;
        accounts::expect_writable(&accounts[1])?;
        escrow_guard(program_id, &accounts[1])?;

        let escrow = {
            let data = accounts[1].try_borrow_data()?;
            require_initialized(&data)?;
            state::read_escrow(&data)?
        };
        let now = unix_now(&accounts[2])?;
        Ok((escrow, now))
    }

    fn store_escrow(ai: &AccountInfo, escrow: &Escrow) -> Result<(), ProgramError> {
        let mut data = state::escrow_data_mut(ai)?;
        state::write_escrow(&mut data, escrow)
    }

    fn pay(escrow: &AccountInfo, dest: &AccountInfo, payout: Payout) -> ProgramResult {
        let amount = u64::try_from(payout.amount).map_err(|_| BetmeError::LamportOverflow)?;
        msg!("payout: role={:?} amount={}", payout.role, amount);
        lamports::pay_out(escrow, dest, amount)
    }

    fn to_value(amount: u64) -> u128 {
        u128::from(amount)
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitEscrow { deadline, fee_percent, arbiter, opponent, penalty_amount, assertion } => {
                msg!("Instruction: InitEscrow");
                accounts::expect_len(accounts, 3)?;
                let a_owner = &accounts[0];
                let a_escrow = &accounts[1];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_escrow)?;
                // escrow keypair must co-sign initialization
                accounts::expect_signer(a_escrow)?;
                escrow_guard(program_id, a_escrow)?;
                let now = unix_now(&accounts[2])?;

                let mut data = state::escrow_data_mut(a_escrow)?;
                let header = state::read_header(&data);
                if header.magic == MAGIC { return Err(BetmeError::AlreadyInitialized.into()); }

                let params = CreateParams {
                    assertion,
                    deadline,
                    fee_percent,
                    arbiter: arbiter.to_bytes(),
                    opponent: opponent.to_bytes(),
                    penalty_amount: to_value(penalty_amount),
                };
                let escrow = Escrow::new(a_owner.key.to_bytes(), params, now).map_err(map_escrow_error)?;

                data.fill(0);
                state::write_escrow(&mut data, &escrow)?;
            },
            Instruction::SetAssertion { assertion } => {
                msg!("Instruction: SetAssertion");
                let (mut escrow, _) = open_escrow(program_id, accounts, 3)?;
                escrow.set_assertion(&caller(accounts), &assertion).map_err(map_escrow_error)?;
                store_escrow(&accounts[1], &escrow)?;
            },
            Instruction::SetDeadline { deadline } => {
                msg!("Instruction: SetDeadline");
                let (mut escrow, now) = open_escrow(program_id, accounts, 3)?;
                escrow.set_deadline(&caller(accounts), deadline, now).map_err(map_escrow_error)?;
                store_escrow(&accounts[1], &escrow)?;
            },
            Instruction::SetFeePercent { fee_percent } => {
                msg!("Instruction: SetFeePercent");
                let (mut escrow, _) = open_escrow(program_id, accounts, 3)?;
                escrow.set_fee_percent(&caller(accounts), fee_percent).map_err(map_escrow_error)?;
                store_escrow(&accounts[1], &escrow)?;
            },
            Instruction::SetArbiter { arbiter } => {
                msg!("Instruction: SetArbiter");
                let (mut escrow, _) = open_escrow(program_id, accounts, 3)?;
                escrow.set_arbiter(&caller(accounts), arbiter.to_bytes()).map_err(map_escrow_error)?;
                store_escrow(&accounts[1], &escrow)?;
            },
            Instruction::SetOpponent { opponent } => {
                msg!("Instruction: SetOpponent");
                let (mut escrow, _) = open_escrow(program_id, accounts, 3)?;
                escrow.set_opponent(&caller(accounts), opponent.to_bytes()).map_err(map_escrow_error)?;
                store_escrow(&accounts[1], &escrow)?;
            },
            Instruction::SetPenaltyAmount { amount } => {
                msg!("Instruction: SetPenaltyAmount");
                let (mut escrow, _) = open_escrow(program_id, accounts, 3)?;
                escrow.set_penalty_amount(&caller(accounts), to_value(amount)).map_err(map_escrow_error)?;
                store_escrow(&accounts[1], &escrow)?;
            },
            Instruction::PlaceStake { amount } => {
                msg!("Instruction: PlaceStake");
                let (mut escrow, _) = open_escrow(program_id, accounts, 4)?;
                accounts::expect_writable(&accounts[0])?;
                accounts::expect_key(&accounts[3], &system_program::id())?;

                escrow.place_stake(&caller(accounts), to_value(amount)).map_err(map_escrow_error)?;
                lamports::deposit(&accounts[3], &accounts[0], &accounts[1], amount)?;
                store_escrow(&accounts[1], &escrow)?;
            },
            Instruction::ConfirmArbiter { agreed_version, deposit } => {
                msg!("Instruction: ConfirmArbiter");
                let (mut escrow, _) = open_escrow(program_id, accounts, 4)?;
                accounts::expect_writable(&accounts[0])?;
                accounts::expect_key(&accounts[3], &system_program::id())?;

                escrow
                    .confirm_arbiter(&caller(accounts), agreed_version, to_value(deposit))
                    .map_err(map_escrow_error)?;
                lamports::deposit(&accounts[3], &accounts[0], &accounts[1], deposit)?;
                store_escrow(&accounts[1], &escrow)?;
            },
            Instruction::RetreatArbiter => {
                msg!("Instruction: RetreatArbiter");
                let (mut escrow, _) = open_escrow(program_id, accounts, 3)?;
                accounts::expect_writable(&accounts[0])?;

                let refund = escrow.retreat_arbiter(&caller(accounts)).map_err(map_escrow_error)?;
                store_escrow(&accounts[1], &escrow)?;
                pay(&accounts[1], &accounts[0], refund)?;
            },
            Instruction::PlaceOpponentStake { agreed_version, deposit } => {
                msg!("Instruction: PlaceOpponentStake");
                let (mut escrow, now) = open_escrow(program_id, accounts, 4)?;
                accounts::expect_writable(&accounts[0])?;
                accounts::expect_key(&accounts[3], &system_program::id())?;

                escrow
                    .place_opponent_stake(&caller(accounts), agreed_version, to_value(deposit), now)
                    .map_err(map_escrow_error)?;
                lamports::deposit(&accounts[3], &accounts[0], &accounts[1], deposit)?;
                store_escrow(&accounts[1], &escrow)?;
            },
            Instruction::VoteTrue => {
                msg!("Instruction: VoteTrue");
                let (mut escrow, now) = open_escrow(program_id, accounts, 3)?;
                escrow.vote_true(&caller(accounts), now).map_err(map_escrow_error)?;
                store_escrow(&accounts[1], &escrow)?;
            },
            Instruction::VoteFalse => {
                msg!("Instruction: VoteFalse");
                let (mut escrow, now) = open_escrow(program_id, accounts, 3)?;
                escrow.vote_false(&caller(accounts), now).map_err(map_escrow_error)?;
                store_escrow(&accounts[1], &escrow)?;
            },
            Instruction::VoteUnresolvable => {
                msg!("Instruction: VoteUnresolvable");
                let (mut escrow, now) = open_escrow(program_id, accounts, 3)?;
                escrow.vote_unresolvable(&caller(accounts), now).map_err(map_escrow_error)?;
                store_escrow(&accounts[1], &escrow)?;
            },
            Instruction::Withdraw => {
                msg!("Instruction: Withdraw");
                let (mut escrow, now) = open_escrow(program_id, accounts, 3)?;
                accounts::expect_writable(&accounts[0])?;

                let payout = escrow.withdraw(&caller(accounts), now).map_err(map_escrow_error)?;
                store_escrow(&accounts[1], &escrow)?;
                pay(&accounts[1], &accounts[0], payout)?;
            },
            Instruction::Teardown => {
                msg!("Instruction: Teardown");
                let (mut escrow, now) = open_escrow(program_id, accounts, 3)?;
                let a_owner = &accounts[0];
                let a_escrow = &accounts[1];
                accounts::expect_writable(a_owner)?;

                let receipt = escrow.teardown(&caller(accounts), now).map_err(map_escrow_error)?;

                if let Some(amount) = receipt.arbiter_payout {
                    accounts::expect_len(accounts, 4)?;
                    let a_arbiter = &accounts[3];
                    accounts::expect_key(a_arbiter, &Pubkey::new_from_array(escrow.arbiter))?;
                    accounts::expect_writable(a_arbiter)?;
                    pay(a_escrow, a_arbiter, Payout { role: Role::Arbiter, amount })?;
                }

                state::escrow_data_mut(a_escrow)?.fill(0);
                let swept = lamports::sweep(a_escrow, a_owner)?;
                msg!("payout: role={:?} amount={} residual={}", Role::Owner, swept, receipt.owner_residual);
            },
        }
        Ok(())
    }
}

// 8. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult,
        program_error::PrintProgramError, pubkey::Pubkey,
    };
    use crate::{error::BetmeError, processor};

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        if let Err(error) = processor::process_instruction(program_id, accounts, instruction_data) {
            error.print::<BetmeError>();
            return Err(error);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use solana_program::{
        account_info::AccountInfo,
        clock::Clock,
        entrypoint::ProgramResult,
        program_error::ProgramError,
        pubkey::Pubkey,
    };
    use crate::{
        constants::{ESCROW_LEN, FEE_PERCENT_SCALE, MAGIC, VERSION},
        error::{map_escrow_error, BetmeError},
        escrow::{Escrow, EscrowError},
        ix::Instruction,
        processor::process_instruction,
        state,
    };

    const NOW: i64 = 1_700_000_000;
    const DEADLINE: i64 = NOW + 3_600;
    const RENT: u64 = 10_000_000;
    const FUNDS: u64 = 10_000_000_000;
    const BET: u64 = 1_000_000_000;
    const PENALTY: u64 = 200_000_000;

    // --- Harness ---

    struct TestAccount {
        key: Pubkey,
        owner: Pubkey,
        lamports: u64,
        data: Vec<u8>,
        is_signer: bool,
        is_writable: bool,
    }

    impl TestAccount {
        fn new(key: Pubkey, owner: Pubkey, lamports: u64, data: Vec<u8>) -> Self {
            Self { key, owner, lamports, data, is_signer: false, is_writable: false }
        }
        fn signer(mut self) -> Self { self.is_signer = true; self }
        fn writable(mut self) -> Self { self.is_writable = true; self }

        fn to_info<'a>(&'a mut self) -> AccountInfo<'a> {
            AccountInfo::new(
                &self.key,
                self.is_signer,
                self.is_writable,
                &mut self.lamports,
                &mut self.data,
                &self.owner,
                false,
                0,
            )
        }
    }

    fn make_clock(unix_timestamp: i64) -> Vec<u8> {
        let clock = Clock { unix_timestamp, ..Clock::default() };
        bincode::serialize(&clock).unwrap()
    }

    fn wallet() -> TestAccount {
        TestAccount::new(Pubkey::new_unique(), solana_program::system_program::id(), FUNDS, vec![])
            .signer()
            .writable()
    }

    #[derive(Clone, Copy)]
    enum Who { Owner, Arbiter, Opponent, Stranger }

    struct Fixture {
        program_id: Pubkey,
        owner: TestAccount,
        arbiter: TestAccount,
        opponent: TestAccount,
        stranger: TestAccount,
        escrow: TestAccount,
        clock: TestAccount,
        system: TestAccount,
    }

    impl Fixture {
        fn new() -> Self {
            let program_id = Pubkey::new_unique();
            Fixture {
                program_id,
                owner: wallet(),
                arbiter: wallet(),
                opponent: wallet(),
                stranger: wallet(),
                escrow: TestAccount::new(Pubkey::new_unique(), program_id, RENT, vec![0u8; ESCROW_LEN])
                    .signer()
                    .writable(),
                clock: TestAccount::new(solana_program::sysvar::clock::id(), solana_program::sysvar::id(), 0, make_clock(NOW)),
                system: TestAccount::new(solana_program::system_program::id(), Pubkey::default(), 0, vec![]),
            }
        }

        fn set_time(&mut self, now: i64) {
            self.clock.data = make_clock(now);
        }

        fn call(&mut self, who: Who, ix: Instruction) -> ProgramResult {
            let program_id = self.program_id;
            let data = ix.pack().unwrap();
            let caller = match who {
                Who::Owner => &mut self.owner,
                Who::Arbiter => &mut self.arbiter,
                Who::Opponent => &mut self.opponent,
                Who::Stranger => &mut self.stranger,
            };
            let accs = vec![caller.to_info(), self.escrow.to_info(), self.clock.to_info(), self.system.to_info()];
            process_instruction(&program_id, &accs, &data)
        }

        fn teardown(&mut self) -> ProgramResult {
            let program_id = self.program_id;
            let data = Instruction::Teardown.pack().unwrap();
            let accs = vec![self.owner.to_info(), self.escrow.to_info(), self.clock.to_info(), self.arbiter.to_info()];
            process_instruction(&program_id, &accs, &data)
        }

        fn init(&mut self) -> ProgramResult {
            let ix = Instruction::InitEscrow {
                deadline: DEADLINE,
                fee_percent: 10 * FEE_PERCENT_SCALE,
                arbiter: self.arbiter.key,
                opponent: Pubkey::default(),
                penalty_amount: PENALTY,
                assertion: String::from("It will rain in Lisbon on Friday"),
            };
            self.call(Who::Owner, ix)
        }

        fn escrow(&self) -> Escrow {
            state::read_escrow(&self.escrow.data).unwrap()
        }

        /// Staked, arbiter confirmed, opponent committed.
        fn committed(&mut self) {
            self.init().unwrap();
            self.call(Who::Owner, Instruction::PlaceStake { amount: BET }).unwrap();
            let v = self.escrow().state_version;
            self.call(Who::Arbiter, Instruction::ConfirmArbiter { agreed_version: v, deposit: PENALTY }).unwrap();
            self.call(Who::Opponent, Instruction::PlaceOpponentStake { agreed_version: v, deposit: BET }).unwrap();
        }
    }

    fn engine_err(e: EscrowError) -> ProgramResult {
        Err(map_escrow_error(e))
    }

    // --- Tests ---

    #[test]
    fn test_init_escrow() {
        let mut f = Fixture::new();
        f.init().unwrap();

        let header = state::read_header(&f.escrow.data);
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version, VERSION);
        assert_eq!(header.owner, f.owner.key.to_bytes());

        let e = f.escrow();
        assert_eq!(e.assertion, "It will rain in Lisbon on Friday");
        assert_eq!(e.deadline, DEADLINE);
        assert_eq!(e.arbiter, f.arbiter.key.to_bytes());
        assert_eq!(e.penalty_amount, PENALTY as u128);
        assert_eq!(e.state_version, 0);

        assert_eq!(f.init(), Err(BetmeError::AlreadyInitialized.into()));
    }

    #[test]
    fn test_init_rejects_past_deadline() {
        let mut f = Fixture::new();
        f.set_time(DEADLINE);
        assert_eq!(f.init(), engine_err(EscrowError::DeadlineNotInFuture));
        assert_eq!(state::read_header(&f.escrow.data).magic, 0);
    }

    #[test]
    fn test_account_validation() {
        let mut f = Fixture::new();
        f.owner.is_signer = false;
        assert_eq!(f.init(), Err(BetmeError::ExpectedSigner.into()));
        f.owner.is_signer = true;

        f.escrow.is_writable = false;
        assert_eq!(f.init(), Err(BetmeError::ExpectedWritable.into()));
        f.escrow.is_writable = true;

        f.escrow.data.push(0);
        assert_eq!(f.init(), Err(BetmeError::InvalidEscrowLen.into()));
        f.escrow.data.pop();

        f.escrow.owner = Pubkey::new_unique();
        assert_eq!(f.init(), Err(ProgramError::IllegalOwner));
        f.escrow.owner = f.program_id;

        assert_eq!(
            f.call(Who::Owner, Instruction::SetDeadline { deadline: DEADLINE + 1 }),
            Err(BetmeError::NotInitialized.into())
        );
    }

    #[test]
    fn test_init_requires_escrow_signature() {
        let mut f = Fixture::new();
        f.escrow.is_signer = false;
        assert_eq!(f.init(), Err(BetmeError::ExpectedSigner.into()));
        assert_eq!(state::read_header(&f.escrow.data).magic, 0);

        // a stranger cannot claim the owner's pre-created account either
        let ix = Instruction::InitEscrow {
            deadline: DEADLINE,
            fee_percent: 0,
            arbiter: f.arbiter.key,
            opponent: Pubkey::default(),
            penalty_amount: 0,
            assertion: String::from("Mine now"),
        };
        assert_eq!(f.call(Who::Stranger, ix.clone()), Err(BetmeError::ExpectedSigner.into()));

        f.escrow.is_signer = true;
        f.call(Who::Stranger, ix).unwrap();
        assert_eq!(f.escrow().owner, f.stranger.key.to_bytes());
    }

    #[test]
    fn test_decode_rejects_malformed_data() {
        let mut f = Fixture::new();
        let program_id = f.program_id;
        let accs = vec![f.owner.to_info(), f.escrow.to_info(), f.clock.to_info()];

        assert_eq!(process_instruction(&program_id, &accs, &[]), Err(ProgramError::InvalidInstructionData));
        assert_eq!(process_instruction(&program_id, &accs, &[16]), Err(ProgramError::InvalidInstructionData));
        assert_eq!(process_instruction(&program_id, &accs, &[2, 1, 2, 3]), Err(ProgramError::InvalidInstructionData));

        // length prefix 2, then an invalid UTF-8 pair
        let bad_utf8 = [1u8, 2, 0, 0xc3, 0x28];
        assert_eq!(
            process_instruction(&program_id, &accs, &bad_utf8),
            Err(BetmeError::InvalidAssertionEncoding.into())
        );
    }

    #[test]
    fn test_setters_and_version_guard() {
        let mut f = Fixture::new();
        f.init().unwrap();

        assert_eq!(
            f.call(Who::Stranger, Instruction::SetFeePercent { fee_percent: 0 }),
            engine_err(EscrowError::NotOwner)
        );
        f.call(Who::Owner, Instruction::SetAssertion { assertion: String::from("Sunny") }).unwrap();
        f.call(Who::Owner, Instruction::SetFeePercent { fee_percent: 5 * FEE_PERCENT_SCALE }).unwrap();
        f.call(Who::Owner, Instruction::PlaceStake { amount: BET }).unwrap();
        assert_eq!(f.escrow().state_version, 2);

        let before = f.escrow.data.clone();
        let arbiter_before = f.arbiter.lamports;
        assert_eq!(
            f.call(Who::Arbiter, Instruction::ConfirmArbiter { agreed_version: 1, deposit: PENALTY }),
            engine_err(EscrowError::StaleStateVersion)
        );
        assert_eq!(f.escrow.data, before);
        assert_eq!(f.arbiter.lamports, arbiter_before);

        f.call(Who::Arbiter, Instruction::ConfirmArbiter { agreed_version: 2, deposit: PENALTY }).unwrap();
        assert_eq!(
            f.call(Who::Owner, Instruction::SetDeadline { deadline: DEADLINE + 1 }),
            engine_err(EscrowError::ArbiterAlreadyConfirmed)
        );
    }

    #[test]
    fn test_deposits_move_lamports() {
        let mut f = Fixture::new();
        f.committed();

        assert_eq!(f.owner.lamports, FUNDS - BET);
        assert_eq!(f.arbiter.lamports, FUNDS - PENALTY);
        assert_eq!(f.opponent.lamports, FUNDS - BET);
        assert_eq!(f.escrow.lamports, RENT + 2 * BET + PENALTY);

        let e = f.escrow();
        assert_eq!(e.opponent, f.opponent.key.to_bytes());
        assert_eq!(e.vault_balance(), (2 * BET + PENALTY) as u128);
    }

    #[test]
    fn test_deposit_requires_system_program() {
        let mut f = Fixture::new();
        f.init().unwrap();
        f.system.key = Pubkey::new_unique();
        assert_eq!(
            f.call(Who::Owner, Instruction::PlaceStake { amount: BET }),
            Err(ProgramError::InvalidArgument)
        );
    }

    #[test]
    fn test_vote_true_lifecycle() {
        let mut f = Fixture::new();
        f.committed();

        assert_eq!(f.call(Who::Owner, Instruction::Withdraw), engine_err(EscrowError::SettlementNotOpen));
        assert_eq!(f.call(Who::Owner, Instruction::VoteTrue), engine_err(EscrowError::NotArbiter));
        f.call(Who::Arbiter, Instruction::VoteTrue).unwrap();
        assert_eq!(f.call(Who::Arbiter, Instruction::VoteFalse), engine_err(EscrowError::VotingClosed));

        f.call(Who::Owner, Instruction::Withdraw).unwrap();
        f.call(Who::Arbiter, Instruction::Withdraw).unwrap();
        assert_eq!(f.call(Who::Opponent, Instruction::Withdraw), engine_err(EscrowError::NoOpponentPayout));
        assert_eq!(f.call(Who::Owner, Instruction::Withdraw), engine_err(EscrowError::AlreadyPaid));
        assert_eq!(f.call(Who::Stranger, Instruction::Withdraw), engine_err(EscrowError::UnknownCaller));

        // fee is 10% of the bet
        assert_eq!(f.owner.lamports, FUNDS - BET + 2 * BET - BET / 10);
        assert_eq!(f.arbiter.lamports, FUNDS + BET / 10);
        assert_eq!(f.opponent.lamports, FUNDS - BET);
        assert_eq!(f.escrow.lamports, RENT);

        f.teardown().unwrap();
        assert_eq!(f.escrow.lamports, 0);
        assert_eq!(f.owner.lamports, FUNDS + BET - BET / 10 + RENT);
        assert!(f.escrow.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_lazy_arbiter_split() {
        let mut f = Fixture::new();
        f.committed();
        f.set_time(DEADLINE + 1);

        assert_eq!(f.call(Who::Arbiter, Instruction::VoteTrue), engine_err(EscrowError::VotingClosed));
        f.call(Who::Opponent, Instruction::Withdraw).unwrap();
        f.call(Who::Owner, Instruction::Withdraw).unwrap();
        f.call(Who::Arbiter, Instruction::Withdraw).unwrap();

        assert_eq!(f.owner.lamports, FUNDS + PENALTY / 2);
        assert_eq!(f.opponent.lamports, FUNDS + PENALTY / 2);
        assert_eq!(f.arbiter.lamports, FUNDS - PENALTY);
        assert_eq!(f.escrow.lamports, RENT);
    }

    #[test]
    fn test_unresolvable_refunds_everyone() {
        let mut f = Fixture::new();
        f.committed();
        f.call(Who::Arbiter, Instruction::VoteUnresolvable).unwrap();

        f.call(Who::Owner, Instruction::Withdraw).unwrap();
        f.call(Who::Opponent, Instruction::Withdraw).unwrap();
        f.call(Who::Arbiter, Instruction::Withdraw).unwrap();
        assert_eq!(f.owner.lamports, FUNDS);
        assert_eq!(f.opponent.lamports, FUNDS);
        assert_eq!(f.arbiter.lamports, FUNDS);
    }

    #[test]
    fn test_retreat_refunds_penalty() {
        let mut f = Fixture::new();
        f.init().unwrap();
        f.call(Who::Owner, Instruction::PlaceStake { amount: BET }).unwrap();
        f.call(Who::Arbiter, Instruction::ConfirmArbiter { agreed_version: 0, deposit: PENALTY }).unwrap();
        f.call(Who::Arbiter, Instruction::RetreatArbiter).unwrap();

        assert_eq!(f.arbiter.lamports, FUNDS);
        let e = f.escrow();
        assert!(!e.arbiter_confirmed);
        assert_eq!(e.penalty_amount, 0);
        assert_eq!(e.state_version, 0);
    }

    #[test]
    fn test_teardown_settles_arbiter_and_sweeps() {
        let mut f = Fixture::new();
        f.init().unwrap();
        f.call(Who::Owner, Instruction::PlaceStake { amount: BET }).unwrap();
        f.call(Who::Arbiter, Instruction::ConfirmArbiter { agreed_version: 0, deposit: PENALTY }).unwrap();

        assert_eq!(f.call(Who::Arbiter, Instruction::Teardown), engine_err(EscrowError::NotOwner));
        f.teardown().unwrap();

        assert_eq!(f.arbiter.lamports, FUNDS);
        assert_eq!(f.owner.lamports, FUNDS + RENT);
        assert_eq!(f.escrow.lamports, 0);
        assert_eq!(
            f.call(Who::Owner, Instruction::PlaceStake { amount: BET }),
            Err(BetmeError::NotInitialized.into())
        );
    }

    #[test]
    fn test_teardown_checks_arbiter_account() {
        let mut f = Fixture::new();
        f.init().unwrap();
        f.call(Who::Owner, Instruction::PlaceStake { amount: BET }).unwrap();
        f.call(Who::Arbiter, Instruction::ConfirmArbiter { agreed_version: 0, deposit: PENALTY }).unwrap();

        f.arbiter.key = Pubkey::new_unique();
        assert_eq!(f.teardown(), Err(ProgramError::InvalidArgument));
        assert_eq!(state::read_header(&f.escrow.data).magic, MAGIC);
    }

    #[test]
    fn test_teardown_blocked_while_voting() {
        let mut f = Fixture::new();
        f.committed();
        assert_eq!(f.teardown(), engine_err(EscrowError::VotingInProgress));
        f.call(Who::Arbiter, Instruction::VoteFalse).unwrap();
        assert_eq!(f.teardown(), engine_err(EscrowError::OpponentPayoutPending));
        f.call(Who::Opponent, Instruction::Withdraw).unwrap();
        f.teardown().unwrap();
        assert_eq!(f.opponent.lamports, FUNDS + BET - BET / 10);
        assert_eq!(f.arbiter.lamports, FUNDS + BET / 10);
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ProgramError::from(BetmeError::InvalidMagic), ProgramError::Custom(0));
        assert_eq!(map_escrow_error(EscrowError::NotOwner), ProgramError::Custom(BetmeError::EngineNotOwner as u32));
        assert_eq!(
            <BetmeError as num_traits::FromPrimitive>::from_u32(BetmeError::EngineOverflow as u32),
            Some(BetmeError::EngineOverflow)
        );
    }
}
