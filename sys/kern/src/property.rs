// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Publish-and-subscribe properties.
//!
//! A property is a `(category, key)`-addressed cell with a declared type and
//! size cap, plus a queue of subscribers waiting for the next write. Attach
//! may precede define, so a property can exist in an undefined placeholder
//! state; reads fail until someone defines it.

use abi::{
    PropertyInfo, PROPERTY_TYPE_BYTE_ARRAY, PROPERTY_TYPE_INT,
    PROPERTY_TYPE_LARGE_BYTE_ARRAY,
};

use crate::reqsts::Waiter;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PropertyType {
    IntData,
    BinData,
}

impl PropertyType {
    /// Maps a declared guest type. Unknown declarations are an argument
    /// error at the define call.
    pub fn from_declared(kind: u16) -> Option<Self> {
        match kind {
            PROPERTY_TYPE_INT => Some(Self::IntData),
            PROPERTY_TYPE_BYTE_ARRAY | PROPERTY_TYPE_LARGE_BYTE_ARRAY => {
                Some(Self::BinData)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Unset,
    Int(i32),
    Bin(Vec<u8>),
}

#[derive(Debug)]
pub struct Property {
    pub category: i32,
    pub key: i32,
    /// `None` until defined.
    declared: Option<(PropertyType, u32)>,
    value: PropertyValue,
    pub subscribers: Vec<Waiter>,
}

impl Property {
    pub fn new(category: i32, key: i32) -> Self {
        Self {
            category,
            key,
            declared: None,
            value: PropertyValue::Unset,
            subscribers: Vec::new(),
        }
    }

    pub fn is_defined(&self) -> bool {
        self.declared.is_some()
    }

    /// Records (or re-records) the declared type and size cap.
    pub fn define(&mut self, info: &PropertyInfo) -> Option<()> {
        let kind = PropertyType::from_declared(info.kind)?;
        self.declared = Some((kind, u32::from(info.size)));
        Some(())
    }

    /// Stores an integer value. Fails on type mismatch.
    pub fn set_int(&mut self, value: i32) -> bool {
        match self.declared {
            Some((PropertyType::IntData, _)) => {
                self.value = PropertyValue::Int(value);
                true
            }
            _ => false,
        }
    }

    /// Stores a byte value. Fails on type mismatch or when the payload
    /// exceeds the declared cap.
    pub fn set_bin(&mut self, data: &[u8]) -> bool {
        match self.declared {
            Some((PropertyType::BinData, cap)) if data.len() as u32 <= cap => {
                self.value = PropertyValue::Bin(data.to_vec());
                true
            }
            _ => false,
        }
    }

    pub fn get_int(&self) -> Option<i32> {
        match self.value {
            PropertyValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn get_bin(&self) -> Option<&[u8]> {
        match &self.value {
            PropertyValue::Bin(data) => Some(data),
            _ => None,
        }
    }

    /// Detaches all current subscribers for completion by the caller. Every
    /// write completes the whole queue.
    pub fn take_subscribers(&mut self) -> Vec<Waiter> {
        std::mem::take(&mut self.subscribers)
    }

    /// Removes this thread's subscriptions (cancellation path).
    pub fn take_subscriptions_of(
        &mut self,
        thread: crate::object::ObjectId,
    ) -> Vec<Waiter> {
        let (mine, rest): (Vec<_>, Vec<_>) = self
            .subscribers
            .drain(..)
            .partition(|waiter| waiter.thread == thread);
        self.subscribers = rest;
        mine
    }
}
