// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Test utilities for link testing

#![allow(clippy::unwrap_used, clippy::expect_used)]

use framelink_core::buffer::PayloadInfo;
use framelink_core::ipc::IpcChannelTable;
use framelink_core::platform::RecordingPlatform;
use framelink_core::{
    Buffer, BufferId, BufferList, BufferType, ChannelInfo, LinkContext, LinkId, LinkInfo,
    LinkInterface, LinkRegistry, LinkServices, LocalAddr, Mailbox, MailboxReceiver, NotifyHub,
    Payload, QueueInfo,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Services with an initialized registry and a counting platform.
pub fn services() -> (LinkServices, Arc<RecordingPlatform>) {
    let registry = LinkRegistry::new();
    registry.init().unwrap();
    let platform = Arc::new(RecordingPlatform::default());
    let services = LinkServices {
        registry,
        notify: NotifyHub::new(),
        ipc: Arc::new(IpcChannelTable::default()),
        platform: platform.clone(),
    };
    (services, platform)
}

/// Registers `id` and returns a context for it plus its mailbox receiver.
pub fn context(services: &LinkServices, id: u32, kind: &str) -> (LinkContext, MailboxReceiver) {
    let (mailbox, rx) = Mailbox::channel(LinkId(id), 16);
    services.registry.register(LinkId(id), kind, mailbox.clone()).unwrap();
    (LinkContext::new(LinkId(id), kind, services.clone(), mailbox), rx)
}

pub fn buffer(link: u32, index: u32, channel: u16) -> Buffer {
    Buffer::new(
        BufferId { link: LinkId(link), index },
        BufferType::VideoFrame,
        channel,
        Payload::single(
            LocalAddr(0x10_0000 + 0x1000 * u64::from(index)),
            0x1000,
            PayloadInfo::Video { width: 32, height: 32, pitch: 128 },
        ),
    )
}

/// A producer whose full queue is filled by the test and which records returns.
pub struct ScriptedProducer {
    info: LinkInfo,
    ready: Mutex<VecDeque<Buffer>>,
    returned: Mutex<Vec<Buffer>>,
}

impl ScriptedProducer {
    pub fn new(channels: usize) -> Arc<Self> {
        Arc::new(Self {
            info: LinkInfo::single(QueueInfo {
                channels: vec![
                    ChannelInfo { buf_type: BufferType::VideoFrame, width: 32, height: 32, pitch: 128 };
                    channels
                ],
            }),
            ready: Mutex::new(VecDeque::new()),
            returned: Mutex::new(Vec::new()),
        })
    }

    /// Registers and attaches the producer under `id`.
    pub fn install(self: &Arc<Self>, services: &LinkServices, id: u32) -> MailboxReceiver {
        let (mailbox, rx) = Mailbox::channel(LinkId(id), 16);
        services.registry.register(LinkId(id), "scripted", mailbox).unwrap();
        services.registry.attach(LinkId(id), self.clone()).unwrap();
        rx
    }

    pub fn offer(&self, buffer: Buffer) {
        self.ready.lock().unwrap().push_back(buffer);
    }

    pub fn pending(&self) -> usize {
        self.ready.lock().unwrap().len()
    }

    pub fn returned_ids(&self) -> Vec<u32> {
        self.returned.lock().unwrap().iter().map(|b| b.id().index).collect()
    }

    pub fn take_returned(&self) -> Vec<Buffer> {
        std::mem::take(&mut *self.returned.lock().unwrap())
    }
}

impl LinkInterface for ScriptedProducer {
    fn get_full_buffers(&self, _queue: usize) -> BufferList {
        let mut ready = self.ready.lock().unwrap();
        let mut list = BufferList::new();
        while !list.is_full() {
            let Some(buffer) = ready.pop_front() else {
                break;
            };
            list.push(buffer).unwrap();
        }
        list
    }

    fn put_empty_buffers(&self, _queue: usize, buffers: BufferList) {
        self.returned.lock().unwrap().extend(buffers);
    }

    fn get_info(&self) -> LinkInfo {
        self.info.clone()
    }
}
