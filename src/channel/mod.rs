//! Live classification channel: outbound audio frames, inbound predictions

pub mod backoff;
pub mod connector;
pub mod frames;
pub mod listener;
pub mod socketio;
pub mod types;

pub use backoff::ReconnectPolicy;
pub use connector::{InboundEvent, PushConnection, PushConnector};
pub use frames::{FrameBatcher, MIN_FRAME_SAMPLES};
pub use listener::{PushChannelListener, Subscription};
pub use socketio::SocketIoConnector;
pub use types::{
    parse_predictions, AudioFrame, ChannelState, ListenerEvent, Prediction, ResultSet,
};
