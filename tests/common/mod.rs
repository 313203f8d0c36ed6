// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! A scripted stand-in for a radio on the other end of a serial cable.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use radflash::Transport;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

struct Shared {
    inbox: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    responder: Responder,
}

fn pop(shared: &Mutex<Shared>, buffer: &mut [u8]) -> io::Result<usize> {
    let mut shared = shared.lock().unwrap();
    if shared.inbox.is_empty() {
        drop(shared);
        thread::sleep(Duration::from_millis(1));
        return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
    }
    let count = buffer.len().min(shared.inbox.len());
    for slot in buffer.iter_mut().take(count) {
        *slot = shared.inbox.pop_front().unwrap();
    }
    Ok(count)
}

/// Every write is handed to the responder, whose answer is queued for the host to read.
pub struct MockRadio {
    shared: Arc<Mutex<Shared>>,
    closed: Arc<AtomicUsize>,
}

/// Inspects a [MockRadio] after it has been handed over.
#[derive(Clone)]
pub struct Probe {
    shared: Arc<Mutex<Shared>>,
    closed: Arc<AtomicUsize>,
}

impl MockRadio {
    pub fn new<F>(responder: F) -> (Self, Probe)
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let shared = Arc::new(Mutex::new(Shared {
            inbox: VecDeque::new(),
            written: vec![],
            responder: Box::new(responder),
        }));
        let closed = Arc::new(AtomicUsize::new(0));
        let probe = Probe {
            shared: Arc::clone(&shared),
            closed: Arc::clone(&closed),
        };
        (Self { shared, closed }, probe)
    }
}

impl Probe {
    /// Every buffer written by the host, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.lock().unwrap().written.clone()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Read for MockRadio {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        pop(&self.shared, buffer)
    }
}

impl Write for MockRadio {
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        let mut shared = self.shared.lock().unwrap();
        shared.written.push(buffer.to_vec());
        let reply = (shared.responder)(buffer);
        shared.inbox.extend(reply);
        Ok(buffer.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MockRadio {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockReader {
    shared: Arc<Mutex<Shared>>,
}

impl Read for MockReader {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        pop(&self.shared, buffer)
    }
}

impl Transport for MockRadio {
    fn try_clone_reader(&self) -> radflash::Result<Box<dyn Read + Send>> {
        Ok(Box::new(MockReader {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn discard_input(&mut self) -> radflash::Result<()> {
        self.shared.lock().unwrap().inbox.clear();
        Ok(())
    }
}

/// A path under the system temp directory unique to this test process.
pub fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("radflash-{}-{}", std::process::id(), name))
}
