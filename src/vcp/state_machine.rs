//! Per-device connection state machine.
//!
//! Every remote device gets one actor task that consumes its inbox strictly
//! in arrival order: explicit requests, stack connection events, timeout
//! expiry and state queries all go through the same `select!` loop, which is
//! what keeps the transition table deterministic.

use std::{
   collections::VecDeque,
   mem,
   sync::{Arc, Weak},
   time::Duration,
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use futures::future;
use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, Instant},
};

use crate::{
   error::{Result, VcpError},
   stack::native::NativeStack,
   vcp::protocol::ConnectionState,
};

/// Hooks a state machine calls back into.
pub trait MachineContext: Send + Sync {
   /// Single policy gate for every connection attempt.
   fn ok_to_connect(&self, device: Address) -> bool;

   /// Called once per observable transition, on the device's actor task.
   fn connection_state_changed(
      &self,
      device: Address,
      previous: ConnectionState,
      state: ConnectionState,
   );
}

#[derive(Debug)]
pub(crate) enum Message {
   Connect,
   Disconnect,
   Stack(ConnectionState),
   GetState(oneshot::Sender<ConnectionState>),
   Timeout,
}

/// Handle to a running device state machine.
pub struct DeviceStateMachine {
   device: Address,
   inbox: mpsc::Sender<Message>,
   state: Arc<AtomicCell<ConnectionState>>,
   task: JoinHandle<()>,
}

impl DeviceStateMachine {
   /// Spawns the actor on the current tokio runtime.
   pub fn spawn(
      device: Address,
      timeout: Duration,
      queue_depth: usize,
      stack: Arc<dyn NativeStack>,
      context: Weak<dyn MachineContext>,
   ) -> Self {
      let (inbox, rx) = mpsc::channel(queue_depth.max(1));
      let state = Arc::new(AtomicCell::new(ConnectionState::Disconnected));
      let actor = MachineActor {
         device,
         state: ConnectionState::Disconnected,
         shared: state.clone(),
         inbox: rx,
         stack,
         context,
         timeout,
         deadline: None,
         deferred: VecDeque::new(),
         transitioned: false,
      };
      let task = tokio::spawn(actor.run());
      Self {
         device,
         inbox,
         state,
         task,
      }
   }

   pub fn device(&self) -> Address {
      self.device
   }

   /// State as of the last processed message.
   pub fn state(&self) -> ConnectionState {
      self.state.load()
   }

   pub fn connect(&self) -> Result<()> {
      self.send(Message::Connect)
   }

   pub fn disconnect(&self) -> Result<()> {
      self.send(Message::Disconnect)
   }

   pub fn stack_event(&self, state: ConnectionState) -> Result<()> {
      self.send(Message::Stack(state))
   }

   /// State after every message queued before this call has been processed.
   pub async fn query_state(&self) -> Result<ConnectionState> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(Message::GetState(tx))
         .await
         .map_err(|_| VcpError::InboxClosed(self.device))?;
      rx.await.map_err(|_| VcpError::InboxClosed(self.device))
   }

   fn send(&self, message: Message) -> Result<()> {
      self.inbox.try_send(message).map_err(|e| match e {
         mpsc::error::TrySendError::Full(message) => {
            warn!("{}: inbox overflow, dropping {message:?}", self.device);
            VcpError::InboxFull(self.device)
         },
         mpsc::error::TrySendError::Closed(_) => VcpError::InboxClosed(self.device),
      })
   }

   /// Stops the actor without emitting anything further.
   pub fn abort(&self) {
      self.task.abort();
   }
}

struct MachineActor {
   device: Address,
   state: ConnectionState,
   shared: Arc<AtomicCell<ConnectionState>>,
   inbox: mpsc::Receiver<Message>,
   stack: Arc<dyn NativeStack>,
   context: Weak<dyn MachineContext>,
   timeout: Duration,
   deadline: Option<Instant>,
   deferred: VecDeque<Message>,
   transitioned: bool,
}

async fn expire(deadline: Option<Instant>) {
   match deadline {
      Some(deadline) => time::sleep_until(deadline).await,
      None => future::pending().await,
   }
}

impl MachineActor {
   async fn run(mut self) {
      debug!("{}: state machine started", self.device);
      loop {
         let message = select! {
             biased;
             message = self.inbox.recv() => {
                 let Some(message) = message else {
                     break;
                 };
                 message
             }
             () = expire(self.deadline) => {
                 self.deadline = None;
                 Message::Timeout
             }
         };
         if !self.process(message) {
            break;
         }
      }
      debug!("{}: state machine stopped in {}", self.device, self.state);
   }

   /// Returns `false` once the owning service is gone.
   fn process(&mut self, message: Message) -> bool {
      let Some(context) = self.context.upgrade() else {
         return false;
      };
      self.dispatch(message, &*context);

      // Deferred requests get another chance after every transition.
      while mem::take(&mut self.transitioned) && !self.deferred.is_empty() {
         for message in mem::take(&mut self.deferred) {
            self.dispatch(message, &*context);
         }
      }
      self.transitioned = false;
      true
   }

   fn dispatch(&mut self, message: Message, context: &dyn MachineContext) {
      if let Message::GetState(reply) = message {
         let _ = reply.send(self.state);
         return;
      }
      match self.state {
         ConnectionState::Disconnected => self.on_disconnected(message, context),
         ConnectionState::Connecting => self.on_connecting(message, context),
         ConnectionState::Connected => self.on_connected(message, context),
         ConnectionState::Disconnecting => self.on_disconnecting(message, context),
      }
   }

   fn on_disconnected(&mut self, message: Message, context: &dyn MachineContext) {
      let addr = self.device;
      match message {
         Message::Connect => {
            if context.ok_to_connect(addr) {
               self.stack.connect(addr);
               self.transition(ConnectionState::Connecting, context);
            } else {
               warn!("{addr}: outgoing connect request rejected by policy");
            }
         },
         Message::Stack(state @ (ConnectionState::Connecting | ConnectionState::Connected)) => {
            if context.ok_to_connect(addr) {
               self.transition(state, context);
            } else {
               warn!("{addr}: incoming {state} rejected by policy");
               self.stack.disconnect(addr);
            }
         },
         Message::Stack(state) => {
            debug!("{addr}: ignoring stack {state} while disconnected");
         },
         Message::Disconnect | Message::Timeout | Message::GetState(_) => {},
      }
   }

   fn on_connecting(&mut self, message: Message, context: &dyn MachineContext) {
      let addr = self.device;
      match message {
         Message::Stack(ConnectionState::Connected) => {
            self.transition(ConnectionState::Connected, context);
         },
         Message::Stack(ConnectionState::Disconnected) => {
            // Idempotent on the stack side; clears any half-open link.
            self.stack.disconnect(addr);
            self.transition(ConnectionState::Disconnected, context);
         },
         Message::Stack(ConnectionState::Disconnecting) => {
            warn!("{addr}: connecting interrupted, device is disconnecting");
            self.begin_disconnect(context);
         },
         Message::Disconnect => self.begin_disconnect(context),
         Message::Timeout => {
            warn!("{addr}: connection timed out");
            self.stack.disconnect(addr);
            self.transition(ConnectionState::Disconnected, context);
         },
         Message::Connect
         | Message::Stack(ConnectionState::Connecting)
         | Message::GetState(_) => {},
      }
   }

   fn on_connected(&mut self, message: Message, context: &dyn MachineContext) {
      match message {
         Message::Disconnect | Message::Stack(ConnectionState::Disconnecting) => {
            self.begin_disconnect(context);
         },
         Message::Stack(ConnectionState::Disconnected) => {
            self.transition(ConnectionState::Disconnected, context);
         },
         Message::Connect
         | Message::Stack(ConnectionState::Connecting | ConnectionState::Connected)
         | Message::Timeout
         | Message::GetState(_) => {},
      }
   }

   fn on_disconnecting(&mut self, message: Message, context: &dyn MachineContext) {
      let addr = self.device;
      match message {
         Message::Stack(ConnectionState::Disconnected) => {
            self.transition(ConnectionState::Disconnected, context);
         },
         Message::Stack(state @ (ConnectionState::Connecting | ConnectionState::Connected)) => {
            if context.ok_to_connect(addr) {
               warn!("{addr}: disconnecting interrupted, device is {state}");
               self.transition(state, context);
            } else {
               self.stack.disconnect(addr);
            }
         },
         Message::Timeout => {
            warn!("{addr}: disconnection timed out");
            self.stack.disconnect(addr);
            self.transition(ConnectionState::Disconnected, context);
         },
         Message::Connect => self.deferred.push_back(message),
         Message::Disconnect
         | Message::Stack(ConnectionState::Disconnecting)
         | Message::GetState(_) => {},
      }
   }

   fn begin_disconnect(&mut self, context: &dyn MachineContext) {
      self.stack.disconnect(self.device);
      self.transition(ConnectionState::Disconnecting, context);
   }

   fn transition(&mut self, next: ConnectionState, context: &dyn MachineContext) {
      let previous = self.state;
      if previous == next {
         return;
      }
      self.state = next;
      self.shared.store(next);
      self.deadline = match next {
         ConnectionState::Connecting | ConnectionState::Disconnecting => {
            Some(Instant::now() + self.timeout)
         },
         ConnectionState::Connected | ConnectionState::Disconnected => None,
      };
      self.transitioned = true;
      info!("{}: {previous} -> {next}", self.device);
      context.connection_state_changed(self.device, previous, next);
   }
}
