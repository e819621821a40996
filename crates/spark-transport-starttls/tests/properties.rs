//! 通道生命周期的模型化性质测试。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：任意 connect / disconnect / request_secure_stream / reconnect 序列下，
//!   通道的状态与事件计数都必须与影子模型一致；每次断开后不得残留任何上一代资源。
//! - **设计手法 (How)**：`ChannelModel` 只记录“是否已连接、是否已有安全层、各事件次数、代号”，
//!   对每个操作先推进模型，再对真实通道执行并逐项比对。
//! - **合同 (What)**：
//!   - 断开后：状态为 Disconnected，代号、本地端点、证书信息全部为空；
//!   - 重复 connect 不改变代号；重复 disconnect 不触发事件；
//!   - 安全层只在已连接时创建，且在同一代内身份不变。
//! - **代价 (Trade-offs)**：使用真实环回服务端，用例数控制在较小范围以保证执行时间。

mod support;

use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use proptest::prelude::*;
use spark_transport_starttls::{
    Channel, ChannelConfig, ChannelError, ChannelState, LayerIdentity,
};

fn shared_server() -> SocketAddr {
    static SERVER: OnceLock<SocketAddr> = OnceLock::new();
    *SERVER.get_or_init(|| support::spawn_plain_server("model").expect("启动共享明文服务端"))
}

#[derive(Clone, Copy, Debug)]
enum Op {
    Connect,
    Disconnect,
    RequestSecure,
    Reconnect,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Connect),
        3 => Just(Op::Disconnect),
        2 => Just(Op::RequestSecure),
        1 => Just(Op::Reconnect),
    ]
}

/// 影子模型。
#[derive(Debug, Default)]
struct ChannelModel {
    connected: bool,
    secure: bool,
    generation: u64,
    ever_connected: bool,
    connected_events: usize,
    disconnected_events: usize,
}

impl ChannelModel {
    fn connect(&mut self) {
        if self.connected {
            return;
        }
        self.connected = true;
        self.ever_connected = true;
        self.secure = false;
        self.generation += 1;
        self.connected_events += 1;
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.disconnected_events += 1;
        }
        self.connected = false;
        self.secure = false;
    }

    fn state(&self) -> ChannelState {
        match (self.connected, self.secure) {
            (false, _) => ChannelState::Disconnected,
            (true, false) => ChannelState::Connected,
            (true, true) => ChannelState::ConnectedSecure,
        }
    }
}

struct Counters {
    connected: Arc<AtomicUsize>,
    disconnected: Arc<AtomicUsize>,
}

fn instrument(channel: &mut Channel) -> Counters {
    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));
    {
        let connected = Arc::clone(&connected);
        channel.notifier().on_connected(move |_| {
            connected.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let disconnected = Arc::clone(&disconnected);
        channel.notifier().on_disconnected(move |_| {
            disconnected.fetch_add(1, Ordering::SeqCst);
        });
    }
    Counters {
        connected,
        disconnected,
    }
}

fn assert_released(channel: &Channel) -> Result<(), TestCaseError> {
    prop_assert_eq!(channel.state(), ChannelState::Disconnected);
    prop_assert_eq!(channel.generation(), None);
    prop_assert_eq!(channel.local_endpoint(), None);
    prop_assert_eq!(channel.remote_endpoint(), None);
    prop_assert!(channel.certificate_info().is_none());
    prop_assert!(channel.certificate_errors().is_empty());
    prop_assert!(!channel.is_secure());
    prop_assert_eq!(channel.bytes_read(), 0);
    Ok(())
}

fn apply(
    op: Op,
    channel: &mut Channel,
    model: &mut ChannelModel,
    server: SocketAddr,
) -> Result<(), TestCaseError> {
    match op {
        Op::Connect => {
            model.connect();
            prop_assert!(channel.connect(server).is_ok());
        }
        Op::Disconnect => {
            model.disconnect();
            channel.disconnect();
            assert_released(channel)?;
        }
        Op::RequestSecure => {
            let result = channel.request_secure_stream();
            if model.connected {
                model.secure = true;
                let expected = LayerIdentity::Secure {
                    generation: model.generation,
                };
                prop_assert_eq!(result.ok(), Some(expected));
            } else {
                prop_assert!(
                    matches!(result, Err(ChannelError::NotConnected { .. })),
                    "未连接时不应建立安全层"
                );
            }
        }
        Op::Reconnect => {
            let result = channel.reconnect();
            if model.ever_connected {
                model.disconnect();
                model.connect();
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(
                    matches!(result, Err(ChannelError::NotConnected { .. })),
                    "从未连接过时 reconnect 没有可复用的端点"
                );
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn lifecycle_matches_model(ops in prop::collection::vec(op(), 1..12)) {
        let server = shared_server();
        let mut channel = Channel::new(ChannelConfig::default());
        let counters = instrument(&mut channel);
        let mut model = ChannelModel::default();

        for op in ops {
            apply(op, &mut channel, &mut model, server)?;
            prop_assert_eq!(channel.state(), model.state(), "after {:?}", op);
            prop_assert_eq!(
                channel.generation(),
                model.connected.then_some(model.generation)
            );
            prop_assert_eq!(counters.connected.load(Ordering::SeqCst), model.connected_events);
            prop_assert_eq!(
                counters.disconnected.load(Ordering::SeqCst),
                model.disconnected_events
            );
        }

        channel.dispose();
        assert_released(&channel)?;
        prop_assert!(channel.connect(server).is_err());
    }
}
