//! Lightwalletd gRPC message and client definitions
//!
//! Hand-written equivalents of the `cash.z.wallet.sdk.rpc` protobuf types,
//! limited to the subset this SDK calls. Field tags follow `service.proto`
//! and `compact_formats.proto` from lightwalletd.

#![allow(missing_docs)] // Proto fields don't need individual docs

use prost::Message;

/// Compact block format for efficient sync.
#[derive(Clone, PartialEq, Message)]
pub struct CompactBlock {
    #[prost(uint32, tag = "1")]
    pub proto_version: u32,
    #[prost(uint64, tag = "2")]
    pub height: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub prev_hash: Vec<u8>,
    #[prost(uint32, tag = "5")]
    pub time: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub header: Vec<u8>,
    #[prost(message, repeated, tag = "7")]
    pub vtx: Vec<CompactTx>,
}

/// Compact transaction containing only shielded components.
#[derive(Clone, PartialEq, Message)]
pub struct CompactTx {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub hash: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub fee: u32,
    #[prost(message, repeated, tag = "4")]
    pub spends: Vec<CompactSaplingSpend>,
    #[prost(message, repeated, tag = "5")]
    pub outputs: Vec<CompactSaplingOutput>,
    #[prost(message, repeated, tag = "6")]
    pub actions: Vec<CompactOrchardAction>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CompactSaplingSpend {
    #[prost(bytes = "vec", tag = "1")]
    pub nf: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CompactSaplingOutput {
    #[prost(bytes = "vec", tag = "1")]
    pub cmu: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub ephemeral_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CompactOrchardAction {
    #[prost(bytes = "vec", tag = "1")]
    pub nullifier: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub cmx: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub ephemeral_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub ciphertext: Vec<u8>,
}

/// Block identifier by height and/or hash.
#[derive(Clone, PartialEq, Message)]
pub struct BlockId {
    #[prost(uint64, tag = "1")]
    pub height: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub hash: Vec<u8>,
}

/// Block range request (inclusive on both ends).
#[derive(Clone, PartialEq, Message)]
pub struct BlockRange {
    #[prost(message, optional, tag = "1")]
    pub start: Option<BlockId>,
    #[prost(message, optional, tag = "2")]
    pub end: Option<BlockId>,
}

/// Transaction filter for GetTransaction.
#[derive(Clone, PartialEq, Message)]
pub struct TxFilter {
    #[prost(message, optional, tag = "1")]
    pub block: Option<BlockId>,
    #[prost(uint64, tag = "2")]
    pub index: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub hash: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, Message)]
pub struct ChainSpec {}

/// Raw transaction data. `height` is 0 for mempool transactions.
#[derive(Clone, PartialEq, Message)]
pub struct RawTransaction {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub height: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct SendResponse {
    #[prost(int32, tag = "1")]
    pub error_code: i32,
    #[prost(string, tag = "2")]
    pub error_message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct LightdInfo {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(string, tag = "2")]
    pub vendor: String,
    #[prost(bool, tag = "3")]
    pub taddr_support: bool,
    #[prost(string, tag = "4")]
    pub chain_name: String,
    #[prost(uint64, tag = "5")]
    pub sapling_activation_height: u64,
    #[prost(string, tag = "6")]
    pub consensus_branch_id: String,
    #[prost(uint64, tag = "7")]
    pub block_height: u64,
    #[prost(string, tag = "8")]
    pub git_commit: String,
    #[prost(string, tag = "9")]
    pub branch: String,
    #[prost(string, tag = "10")]
    pub build_date: String,
    #[prost(string, tag = "11")]
    pub build_user: String,
    #[prost(uint64, tag = "12")]
    pub estimated_height: u64,
    #[prost(string, tag = "13")]
    pub zcashd_build: String,
    #[prost(string, tag = "14")]
    pub zcashd_subversion: String,
}

/// Transparent address and block range for GetTaddressTxids.
#[derive(Clone, PartialEq, Message)]
pub struct TransparentAddressBlockFilter {
    #[prost(string, tag = "1")]
    pub address: String,
    #[prost(message, optional, tag = "2")]
    pub range: Option<BlockRange>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetAddressUtxosArg {
    #[prost(string, repeated, tag = "1")]
    pub addresses: Vec<String>,
    #[prost(uint64, tag = "2")]
    pub start_height: u64,
    #[prost(uint32, tag = "3")]
    pub max_entries: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetAddressUtxosReply {
    #[prost(bytes = "vec", tag = "1")]
    pub txid: Vec<u8>,
    #[prost(int32, tag = "2")]
    pub index: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub script: Vec<u8>,
    #[prost(int64, tag = "4")]
    pub value_zat: i64,
    #[prost(uint64, tag = "5")]
    pub height: u64,
    #[prost(string, tag = "6")]
    pub address: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetAddressUtxosReplyList {
    #[prost(message, repeated, tag = "1")]
    pub address_utxos: Vec<GetAddressUtxosReply>,
}

/// Client for the `CompactTxStreamer` service.
pub mod compact_tx_streamer_client {
    #![allow(unused_variables, dead_code, clippy::wildcard_imports, clippy::let_unit_value)]

    use super::*;
    use tonic::codegen::*;

    const SERVICE: &str = "cash.z.wallet.sdk.rpc.CompactTxStreamer";

    #[derive(Debug, Clone)]
    pub struct CompactTxStreamerClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl CompactTxStreamerClient<tonic::transport::Channel> {
        /// Create a new client from a channel.
        pub fn new(channel: tonic::transport::Channel) -> Self {
            let inner = tonic::client::Grpc::new(channel);
            Self { inner }
        }
    }

    impl<T> CompactTxStreamerClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        async fn ready(&mut self) -> std::result::Result<(), tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })
        }

        fn request<M>(request: impl tonic::IntoRequest<M>, method: &'static str) -> tonic::Request<M> {
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new(SERVICE, method));
            req
        }

        pub async fn get_latest_block(
            &mut self,
            request: impl tonic::IntoRequest<ChainSpec>,
        ) -> std::result::Result<tonic::Response<BlockId>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetLatestBlock",
            );
            let req = Self::request(request, "GetLatestBlock");
            self.inner.unary(req, path, codec).await
        }

        pub async fn get_block_range(
            &mut self,
            request: impl tonic::IntoRequest<BlockRange>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<CompactBlock>>,
            tonic::Status,
        > {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetBlockRange",
            );
            let req = Self::request(request, "GetBlockRange");
            self.inner.server_streaming(req, path, codec).await
        }

        pub async fn get_transaction(
            &mut self,
            request: impl tonic::IntoRequest<TxFilter>,
        ) -> std::result::Result<tonic::Response<RawTransaction>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetTransaction",
            );
            let req = Self::request(request, "GetTransaction");
            self.inner.unary(req, path, codec).await
        }

        pub async fn send_transaction(
            &mut self,
            request: impl tonic::IntoRequest<RawTransaction>,
        ) -> std::result::Result<tonic::Response<SendResponse>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/SendTransaction",
            );
            let req = Self::request(request, "SendTransaction");
            self.inner.unary(req, path, codec).await
        }

        pub async fn get_lightd_info(
            &mut self,
            request: impl tonic::IntoRequest<Empty>,
        ) -> std::result::Result<tonic::Response<LightdInfo>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetLightdInfo",
            );
            let req = Self::request(request, "GetLightdInfo");
            self.inner.unary(req, path, codec).await
        }

        pub async fn get_taddress_txids(
            &mut self,
            request: impl tonic::IntoRequest<TransparentAddressBlockFilter>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<RawTransaction>>,
            tonic::Status,
        > {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetTaddressTxids",
            );
            let req = Self::request(request, "GetTaddressTxids");
            self.inner.server_streaming(req, path, codec).await
        }

        pub async fn get_address_utxos(
            &mut self,
            request: impl tonic::IntoRequest<GetAddressUtxosArg>,
        ) -> std::result::Result<tonic::Response<GetAddressUtxosReplyList>, tonic::Status> {
            self.ready().await?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/cash.z.wallet.sdk.rpc.CompactTxStreamer/GetAddressUtxos",
            );
            let req = Self::request(request, "GetAddressUtxos");
            self.inner.unary(req, path, codec).await
        }
    }
}
