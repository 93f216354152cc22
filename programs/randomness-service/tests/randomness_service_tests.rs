// Instruction-level tests for the randomness service, run against an
// in-process bank with the SPL token programs loaded.

use anchor_lang::solana_program::account_info::AccountInfo;
use anchor_lang::solana_program::entrypoint::ProgramResult;
use anchor_lang::{AccountDeserialize, InstructionData, ToAccountMetas};
use anchor_spl::associated_token::{self, get_associated_token_address};
use anchor_spl::token::{self, spl_token::native_mint};
use solana_program_test::*;
use solana_sdk::{
    account::Account,
    instruction::{AccountMeta, Instruction, InstructionError},
    native_token::LAMPORTS_PER_SOL,
    pubkey::Pubkey,
    rent::Rent,
    signature::{Keypair, Signer},
    system_program,
    sysvar,
    transaction::{Transaction, TransactionError},
};

use randomness_service::errors::RandomnessError;
use randomness_service::state::{
    AccountMetaBorsh, Callback, RandomnessRequest, ServiceConfig, REQUEST_EXPIRY_SLOTS,
};
use randomness_service::CONFIG_SEED;

const COST_PER_BYTE: u64 = 10_000;
const NUM_BYTES: u16 = 8;
const FEE: u64 = COST_PER_BYTE * NUM_BYTES as u64;

fn process_instruction(
    program_id: &Pubkey,
    accounts: &[AccountInfo],
    data: &[u8],
) -> ProgramResult {
    // `entry` ties the slice and its account infos to one lifetime.
    let accounts = Box::leak(Box::new(accounts.to_vec()));
    randomness_service::entry(program_id, accounts, data)
}

// ── Addresses ───────────────────────────────────────────────────────────────

fn config_address() -> Pubkey {
    Pubkey::find_program_address(&[CONFIG_SEED], &randomness_service::ID).0
}

fn wallet_address() -> Pubkey {
    get_associated_token_address(&config_address(), &native_mint::ID)
}

fn escrow_address(request: &Pubkey) -> Pubkey {
    get_associated_token_address(request, &native_mint::ID)
}

fn event_authority() -> Pubkey {
    Pubkey::find_program_address(&[b"__event_authority"], &randomness_service::ID).0
}

// ── Instruction builders ────────────────────────────────────────────────────

fn initialize_ix(authority: &Pubkey, service: &Pubkey, cost_per_byte: u64) -> Instruction {
    Instruction {
        program_id: randomness_service::ID,
        accounts: randomness_service::accounts::Initialize {
            authority: *authority,
            fulfillment_service: *service,
            config: config_address(),
            mint: native_mint::ID,
            wallet: wallet_address(),
            token_program: token::ID,
            associated_token_program: associated_token::ID,
            system_program: system_program::ID,
        }
        .to_account_metas(None),
        data: randomness_service::instruction::Initialize { cost_per_byte }.data(),
    }
}

fn request_ix(requester: &Pubkey, request: &Pubkey, callback: Callback) -> Instruction {
    Instruction {
        program_id: randomness_service::ID,
        accounts: randomness_service::accounts::RequestRandomness {
            payer: *requester,
            config: config_address(),
            request: *request,
            escrow: escrow_address(request),
            mint: native_mint::ID,
            token_program: token::ID,
            associated_token_program: associated_token::ID,
            system_program: system_program::ID,
        }
        .to_account_metas(None),
        data: randomness_service::instruction::RequestRandomness {
            num_bytes: NUM_BYTES,
            callback,
        }
        .data(),
    }
}

fn settle_ix(
    settler: &Pubkey,
    request: &Pubkey,
    requester: &Pubkey,
    callback_program: &Pubkey,
    randomness: Vec<u8>,
) -> Instruction {
    Instruction {
        program_id: randomness_service::ID,
        accounts: randomness_service::accounts::Settle {
            settler: *settler,
            config: config_address(),
            request: *request,
            requester: *requester,
            escrow: escrow_address(request),
            wallet: wallet_address(),
            callback_program: *callback_program,
            token_program: token::ID,
            instructions_sysvar: sysvar::instructions::ID,
            event_authority: event_authority(),
            program: randomness_service::ID,
        }
        .to_account_metas(None),
        data: randomness_service::instruction::Settle { randomness }.data(),
    }
}

fn settle_with_error_ix(settler: &Pubkey, request: &Pubkey, error_message: &str) -> Instruction {
    Instruction {
        program_id: randomness_service::ID,
        accounts: randomness_service::accounts::SettleWithError {
            settler: *settler,
            config: config_address(),
            request: *request,
            escrow: escrow_address(request),
            wallet: wallet_address(),
            token_program: token::ID,
            instructions_sysvar: sysvar::instructions::ID,
            event_authority: event_authority(),
            program: randomness_service::ID,
        }
        .to_account_metas(None),
        data: randomness_service::instruction::SettleWithError {
            randomness: vec![1; usize::from(NUM_BYTES)],
            error_message: error_message.to_string(),
        }
        .data(),
    }
}

fn close_request_ix(signer: &Pubkey, request: &Pubkey, requester: &Pubkey) -> Instruction {
    Instruction {
        program_id: randomness_service::ID,
        accounts: randomness_service::accounts::CloseRequest {
            signer: *signer,
            config: config_address(),
            request: *request,
            requester: *requester,
            escrow: escrow_address(request),
            token_program: token::ID,
        }
        .to_account_metas(None),
        data: randomness_service::instruction::CloseRequest {}.data(),
    }
}

fn close_config_ix(authority: &Pubkey) -> Instruction {
    Instruction {
        program_id: randomness_service::ID,
        accounts: randomness_service::accounts::CloseConfig {
            authority: *authority,
            config: config_address(),
            wallet: wallet_address(),
            token_program: token::ID,
        }
        .to_account_metas(None),
        data: randomness_service::instruction::CloseConfig {}.data(),
    }
}

// ── Harness ─────────────────────────────────────────────────────────────────

/// Wrapped SOL mint: no authorities, 9 decimals.
fn native_mint_account() -> Account {
    let mut data = vec![0u8; 82];
    data[44] = 9; // decimals
    data[45] = 1; // is_initialized
    Account {
        lamports: Rent::default().minimum_balance(data.len()),
        data,
        owner: token::ID,
        executable: false,
        rent_epoch: 0,
    }
}

fn funded(lamports: u64) -> Account {
    Account {
        lamports,
        data: vec![],
        owner: system_program::ID,
        executable: false,
        rent_epoch: 0,
    }
}

struct Setup {
    ctx: ProgramTestContext,
    authority: Keypair,
    service: Keypair,
    requester: Keypair,
}

/// Start a bank with funded service and requester keys and an initialized
/// configuration owned by the bank's payer.
async fn setup() -> Setup {
    let mut pt = ProgramTest::new(
        "randomness_service",
        randomness_service::ID,
        processor!(process_instruction),
    );
    pt.add_account(native_mint::ID, native_mint_account());

    let service = Keypair::new();
    let requester = Keypair::new();
    pt.add_account(service.pubkey(), funded(LAMPORTS_PER_SOL));
    pt.add_account(requester.pubkey(), funded(10 * LAMPORTS_PER_SOL));

    let mut ctx = pt.start_with_context().await;
    let authority = ctx.payer.insecure_clone();

    let ix = initialize_ix(&authority.pubkey(), &service.pubkey(), COST_PER_BYTE);
    send(&mut ctx, &[ix], &[&authority]).await.unwrap();

    Setup {
        ctx,
        authority,
        service,
        requester,
    }
}

/// Sign with `signers` (the first pays) against a fresh blockhash and process.
async fn send(
    ctx: &mut ProgramTestContext,
    instructions: &[Instruction],
    signers: &[&Keypair],
) -> Result<(), BanksClientError> {
    let blockhash = ctx.get_new_latest_blockhash().await.unwrap();
    let tx = Transaction::new_signed_with_payer(
        instructions,
        Some(&signers[0].pubkey()),
        signers,
        blockhash,
    );
    ctx.banks_client.process_transaction(tx).await
}

async fn request_randomness(setup: &mut Setup, callback: Callback) -> Keypair {
    let request = Keypair::new();
    let ix = request_ix(&setup.requester.pubkey(), &request.pubkey(), callback);
    send(&mut setup.ctx, &[ix], &[&setup.requester, &request])
        .await
        .unwrap();
    request
}

async fn read<T: AccountDeserialize>(ctx: &mut ProgramTestContext, address: Pubkey) -> Option<T> {
    let account = ctx.banks_client.get_account(address).await.unwrap()?;
    Some(T::try_deserialize(&mut account.data.as_slice()).unwrap())
}

async fn exists(ctx: &mut ProgramTestContext, address: Pubkey) -> bool {
    ctx.banks_client.get_account(address).await.unwrap().is_some()
}

async fn lamports(ctx: &mut ProgramTestContext, address: Pubkey) -> u64 {
    ctx.banks_client.get_balance(address).await.unwrap()
}

/// Token balance of an SPL token account (`amount` sits at bytes 64..72).
async fn token_amount(ctx: &mut ProgramTestContext, address: Pubkey) -> Option<u64> {
    let account = ctx.banks_client.get_account(address).await.unwrap()?;
    Some(u64::from_le_bytes(account.data[64..72].try_into().unwrap()))
}

async fn pending_requests(ctx: &mut ProgramTestContext) -> u64 {
    read::<ServiceConfig>(ctx, config_address())
        .await
        .unwrap()
        .pending_requests
}

fn custom_error(result: Result<(), BanksClientError>) -> u32 {
    match result.expect_err("transaction should fail").unwrap() {
        TransactionError::InstructionError(_, InstructionError::Custom(code)) => code,
        other => panic!("expected a custom program error, got {other:?}"),
    }
}

// ── Settlement ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn settle_pays_the_service_and_closes_the_request() {
    let mut s = setup().await;
    let request = request_randomness(&mut s, Callback::default()).await;
    let escrow = escrow_address(&request.pubkey());

    assert_eq!(token_amount(&mut s.ctx, escrow).await, Some(FEE));
    assert_eq!(pending_requests(&mut s.ctx).await, 1);
    let record: RandomnessRequest = read(&mut s.ctx, request.pubkey()).await.unwrap();
    assert_eq!(record.requester, s.requester.pubkey());
    assert_eq!(record.fee, FEE);
    assert!(!record.is_completed);

    let ix = settle_ix(
        &s.service.pubkey(),
        &request.pubkey(),
        &s.requester.pubkey(),
        &Pubkey::default(),
        vec![7; usize::from(NUM_BYTES)],
    );
    send(&mut s.ctx, &[ix], &[&s.service]).await.unwrap();

    assert!(!exists(&mut s.ctx, request.pubkey()).await);
    assert!(!exists(&mut s.ctx, escrow).await);
    assert_eq!(token_amount(&mut s.ctx, wallet_address()).await, Some(FEE));
    assert_eq!(pending_requests(&mut s.ctx).await, 0);

    // The record is gone, so account validation rejects a second settlement.
    let again = settle_ix(
        &s.service.pubkey(),
        &request.pubkey(),
        &s.requester.pubkey(),
        &Pubkey::default(),
        vec![8; usize::from(NUM_BYTES)],
    );
    let result = send(&mut s.ctx, &[again], &[&s.service]).await;
    assert_eq!(
        custom_error(result),
        u32::from(anchor_lang::error::ErrorCode::AccountNotInitialized)
    );
    assert_eq!(token_amount(&mut s.ctx, wallet_address()).await, Some(FEE));
}

#[tokio::test]
async fn only_the_bound_service_may_settle() {
    let mut s = setup().await;
    let request = request_randomness(&mut s, Callback::default()).await;

    let impostor = s.requester.insecure_clone();
    let ix = settle_ix(
        &impostor.pubkey(),
        &request.pubkey(),
        &s.requester.pubkey(),
        &Pubkey::default(),
        vec![7; usize::from(NUM_BYTES)],
    );
    let result = send(&mut s.ctx, &[ix], &[&impostor]).await;
    assert_eq!(custom_error(result), u32::from(RandomnessError::Unauthorized));

    let short = settle_ix(
        &s.service.pubkey(),
        &request.pubkey(),
        &s.requester.pubkey(),
        &Pubkey::default(),
        vec![7; usize::from(NUM_BYTES) - 1],
    );
    let result = send(&mut s.ctx, &[short], &[&s.service]).await;
    assert_eq!(custom_error(result), u32::from(RandomnessError::LengthMismatch));
    assert_eq!(token_amount(&mut s.ctx, escrow_address(&request.pubkey())).await, Some(FEE));
}

#[tokio::test]
async fn reinitialize_is_rejected_and_leaves_config_untouched() {
    let mut s = setup().await;
    let before = s
        .ctx
        .banks_client
        .get_account(config_address())
        .await
        .unwrap()
        .unwrap();

    let ix = initialize_ix(&s.authority.pubkey(), &Pubkey::new_unique(), COST_PER_BYTE * 2);
    let result = send(&mut s.ctx, &[ix], &[&s.authority]).await;
    assert_eq!(custom_error(result), u32::from(RandomnessError::AlreadyInitialized));

    let after = s
        .ctx
        .banks_client
        .get_account(config_address())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.data, before.data);
    let config: ServiceConfig = read(&mut s.ctx, config_address()).await.unwrap();
    assert_eq!(config.cost_per_byte, COST_PER_BYTE);
    assert_eq!(config.fulfillment_service, s.service.pubkey());
}

// ── Records kept after settlement ───────────────────────────────────────────

#[tokio::test]
async fn faulted_callback_keeps_the_record_live_until_closed() {
    let mut s = setup().await;
    let callback_program = Pubkey::new_unique();
    let missing = Pubkey::new_unique();
    let callback = Callback {
        program_id: callback_program,
        accounts: vec![
            AccountMetaBorsh {
                pubkey: config_address(),
                is_signer: true,
                is_writable: false,
            },
            AccountMetaBorsh {
                pubkey: missing,
                is_signer: false,
                is_writable: false,
            },
        ],
        ix_data: vec![1],
    };
    let request = request_randomness(&mut s, callback).await;

    // `missing` is not supplied, so the callback cannot be delivered.
    let ix = settle_ix(
        &s.service.pubkey(),
        &request.pubkey(),
        &s.requester.pubkey(),
        &callback_program,
        vec![7; usize::from(NUM_BYTES)],
    );
    send(&mut s.ctx, &[ix], &[&s.service]).await.unwrap();

    assert_eq!(token_amount(&mut s.ctx, wallet_address()).await, Some(FEE));
    let record: RandomnessRequest = read(&mut s.ctx, request.pubkey()).await.unwrap();
    assert!(record.is_completed);
    assert_eq!(record.error_message, format!("missing callback account {missing}"));
    assert_eq!(pending_requests(&mut s.ctx).await, 1);

    let result = send(&mut s.ctx, &[close_config_ix(&s.authority.pubkey())], &[&s.authority]).await;
    assert_eq!(custom_error(result), u32::from(RandomnessError::OutstandingRequests));
    assert!(exists(&mut s.ctx, config_address()).await);

    let retry = settle_ix(
        &s.service.pubkey(),
        &request.pubkey(),
        &s.requester.pubkey(),
        &callback_program,
        vec![9; usize::from(NUM_BYTES)],
    );
    let result = send(&mut s.ctx, &[retry], &[&s.service]).await;
    assert_eq!(custom_error(result), u32::from(RandomnessError::AlreadySettled));

    let close = close_request_ix(&s.requester.pubkey(), &request.pubkey(), &s.requester.pubkey());
    send(&mut s.ctx, &[close], &[&s.requester]).await.unwrap();
    assert!(!exists(&mut s.ctx, request.pubkey()).await);
    assert_eq!(pending_requests(&mut s.ctx).await, 0);

    let authority = s.authority.pubkey();
    let wallet_lamports = lamports(&mut s.ctx, wallet_address()).await;
    let config_lamports = lamports(&mut s.ctx, config_address()).await;
    let before = lamports(&mut s.ctx, authority).await;
    send(&mut s.ctx, &[close_config_ix(&authority)], &[&s.authority])
        .await
        .unwrap();

    assert!(!exists(&mut s.ctx, config_address()).await);
    assert!(!exists(&mut s.ctx, wallet_address()).await);
    let after = lamports(&mut s.ctx, authority).await;
    // Less the transaction fee.
    assert!(after > before + wallet_lamports + config_lamports - LAMPORTS_PER_SOL / 100);
}

#[tokio::test]
async fn settle_with_error_records_the_message_and_pays_once() {
    let mut s = setup().await;
    let request = request_randomness(&mut s, Callback::default()).await;

    let ix = settle_with_error_ix(&s.service.pubkey(), &request.pubkey(), "callback would fail");
    send(&mut s.ctx, &[ix], &[&s.service]).await.unwrap();

    let record: RandomnessRequest = read(&mut s.ctx, request.pubkey()).await.unwrap();
    assert!(record.is_completed);
    assert_eq!(record.error_message, "callback would fail");
    assert_eq!(token_amount(&mut s.ctx, wallet_address()).await, Some(FEE));
    assert_eq!(
        token_amount(&mut s.ctx, escrow_address(&request.pubkey())).await,
        Some(0)
    );
    assert_eq!(pending_requests(&mut s.ctx).await, 1);

    let again = settle_with_error_ix(&s.service.pubkey(), &request.pubkey(), "again");
    let result = send(&mut s.ctx, &[again], &[&s.service]).await;
    assert_eq!(custom_error(result), u32::from(RandomnessError::AlreadySettled));
    assert_eq!(token_amount(&mut s.ctx, wallet_address()).await, Some(FEE));
}

// ── Expiry ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn expired_request_is_refunded_to_the_requester() {
    let mut s = setup().await;
    let request = request_randomness(&mut s, Callback::default()).await;
    let escrow = escrow_address(&request.pubkey());
    let authority = s.authority.pubkey();
    let requester = s.requester.pubkey();

    let close = close_request_ix(&authority, &request.pubkey(), &requester);
    let result = send(&mut s.ctx, &[close.clone()], &[&s.authority]).await;
    assert_eq!(custom_error(result), u32::from(RandomnessError::RequestStillActive));

    let record: RandomnessRequest = read(&mut s.ctx, request.pubkey()).await.unwrap();
    s.ctx
        .warp_to_slot(record.request_slot + REQUEST_EXPIRY_SLOTS + 1)
        .unwrap();

    let refund = lamports(&mut s.ctx, escrow).await + lamports(&mut s.ctx, request.pubkey()).await;
    let before = lamports(&mut s.ctx, requester).await;
    send(&mut s.ctx, &[close], &[&s.authority]).await.unwrap();

    assert!(!exists(&mut s.ctx, request.pubkey()).await);
    assert!(!exists(&mut s.ctx, escrow).await);
    assert_eq!(lamports(&mut s.ctx, requester).await, before + refund);
    assert_eq!(token_amount(&mut s.ctx, wallet_address()).await, Some(0));
    assert_eq!(pending_requests(&mut s.ctx).await, 0);
}

#[tokio::test]
async fn strangers_cannot_close_requests() {
    let mut s = setup().await;
    let request = request_randomness(&mut s, Callback::default()).await;
    let record: RandomnessRequest = read(&mut s.ctx, request.pubkey()).await.unwrap();
    s.ctx
        .warp_to_slot(record.request_slot + REQUEST_EXPIRY_SLOTS + 1)
        .unwrap();

    let stranger = s.service.insecure_clone();
    let close = close_request_ix(&stranger.pubkey(), &request.pubkey(), &s.requester.pubkey());
    let result = send(&mut s.ctx, &[close], &[&stranger]).await;
    assert_eq!(custom_error(result), u32::from(RandomnessError::Unauthorized));
    assert!(exists(&mut s.ctx, request.pubkey()).await);
}
