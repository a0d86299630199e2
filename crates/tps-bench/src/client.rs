use std::{collections::HashMap, sync::Arc};

use alloy_consensus::{SignableTransaction, TxEip1559};
use alloy_eips::{BlockNumberOrTag, eip2718::Encodable2718};
use alloy_network::{ReceiptResponse, TxSignerSync};
use alloy_primitives::{Address, Bytes, TxKind, U256};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use alloy_signer_local::PrivateKeySigner;
use alloy_transport::TransportError;
use async_trait::async_trait;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    api::{BlockSummary, LedgerApi, ReceiptSummary},
    error::{LedgerError, SetupError},
    types::{SubmissionRequest, TxHandle},
};

/// Gas price used when the node does not report one.
const FALLBACK_GAS_PRICE: u128 = 1_000_000_000;

/// [`LedgerApi`] over an EVM JSON-RPC endpoint.
///
/// The client owns the signing keys of every sender for its whole lifetime and
/// signs EIP-1559 transfers locally before submitting them raw.
#[derive(Debug, Clone)]
pub struct AlloyLedgerClient {
    provider: RootProvider,
    signers: Arc<HashMap<Address, PrivateKeySigner>>,
    chain_id: u64,
    gas_price: u128,
}

impl AlloyLedgerClient {
    /// Connects to `rpc_url` and reads the chain id and current gas price.
    pub async fn connect(
        rpc_url: &str,
        signers: impl IntoIterator<Item = PrivateKeySigner>,
    ) -> Result<Self, SetupError> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| SetupError::InvalidConfig(format!("invalid rpc url {rpc_url}: {e}")))?;
        let provider = ProviderBuilder::new().disable_recommended_fillers().connect_http(url);

        let chain_id = provider
            .get_chain_id()
            .await
            .map_err(|e| SetupError::Unreachable(query_error(e)))?;

        let gas_price = match provider.get_gas_price().await {
            Ok(price) => price,
            Err(e) => {
                warn!(error = %e, fallback = FALLBACK_GAS_PRICE, "failed to read gas price");
                FALLBACK_GAS_PRICE
            }
        };

        let signers: HashMap<_, _> =
            signers.into_iter().map(|signer| (signer.address(), signer)).collect();

        info!(rpc_url, chain_id, gas_price, senders = signers.len(), "connected to ledger");

        Ok(Self { provider, signers: Arc::new(signers), chain_id, gas_price })
    }

    /// Chain id reported by the node at connect time.
    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Addresses of every sender this client can sign for.
    pub fn senders(&self) -> Vec<Address> {
        let mut senders: Vec<_> = self.signers.keys().copied().collect();
        senders.sort();
        senders
    }

    fn sign(&self, request: &SubmissionRequest) -> Result<(TxHandle, Bytes), LedgerError> {
        let signer =
            self.signers.get(&request.sender).ok_or(LedgerError::UnknownSender(request.sender))?;
        let price = request.gas_price.unwrap_or(self.gas_price);

        let mut tx = TxEip1559 {
            chain_id: self.chain_id,
            nonce: request.nonce,
            gas_limit: request.gas_limit,
            max_fee_per_gas: price,
            max_priority_fee_per_gas: price,
            to: TxKind::Call(request.recipient),
            value: request.value,
            access_list: Default::default(),
            input: Default::default(),
        };

        let signature = signer
            .sign_transaction_sync(&mut tx)
            .map_err(|e| LedgerError::Malformed(format!("failed to sign transaction: {e}")))?;
        let signed = tx.into_signed(signature);
        let handle = *signed.hash();

        Ok((handle, signed.encoded_2718().into()))
    }
}

#[async_trait]
impl LedgerApi for AlloyLedgerClient {
    async fn submit(&self, request: &SubmissionRequest) -> Result<TxHandle, LedgerError> {
        let (handle, raw) = self.sign(request)?;
        let _ = self.provider.send_raw_transaction(&raw).await.map_err(submit_error)?;
        debug!(%handle, sender = %request.sender, nonce = request.nonce, "transaction submitted");
        Ok(handle)
    }

    async fn sequence_number(&self, account: Address) -> Result<u64, LedgerError> {
        self.provider.get_transaction_count(account).await.map_err(query_error)
    }

    async fn balance(&self, account: Address) -> Result<U256, LedgerError> {
        self.provider.get_balance(account).await.map_err(query_error)
    }

    async fn block_height(&self) -> Result<u64, LedgerError> {
        self.provider.get_block_number().await.map_err(query_error)
    }

    async fn block(&self, height: u64) -> Result<Option<BlockSummary>, LedgerError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(height))
            .await
            .map_err(query_error)?;

        Ok(block.map(|block| BlockSummary {
            number: block.header.number,
            timestamp: block.header.timestamp,
            transaction_count: block.transactions.len() as u64,
            gas_used: block.header.gas_used,
            gas_limit: block.header.gas_limit,
        }))
    }

    async fn receipt(&self, handle: TxHandle) -> Result<Option<ReceiptSummary>, LedgerError> {
        let receipt = self.provider.get_transaction_receipt(handle).await.map_err(query_error)?;

        // Pending receipts carry no block number and count as not included.
        Ok(receipt.and_then(|receipt| {
            receipt
                .block_number()
                .map(|block_number| ReceiptSummary { block_number, succeeded: receipt.status() })
        }))
    }
}

/// Error responses to a submission are rejections; anything else is transport.
fn submit_error(error: TransportError) -> LedgerError {
    match error.as_error_resp() {
        Some(payload) => LedgerError::Rejected(payload.message.to_string()),
        None => LedgerError::Transport(error.to_string()),
    }
}

fn query_error(error: TransportError) -> LedgerError {
    LedgerError::Transport(error.to_string())
}
