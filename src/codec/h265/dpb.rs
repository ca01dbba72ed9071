// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoded picture buffer interface that reference list construction
//! relies on, and a small in-memory implementation of it.

use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::rc::Rc;

use anyhow::anyhow;

use crate::codec::h265::picture::PictureData;
use crate::codec::h265::picture::Reference;

/// Looks reference pictures up by POC on behalf of
/// [`crate::codec::h265::rps::update_reference_list`].
pub trait ReferenceLookup {
    /// A handle on a decoded picture.
    type Frame: Clone;

    /// Finds the short-term reference picture with `poc`.
    fn find_short_term_reference(&self, poc: i32) -> Option<Self::Frame>;

    /// Finds the long-term reference picture with `poc`, decoded before
    /// `anchor`. When `msb_unknown` is set only the `lsb_bits` least
    /// significant bits of the POCs are compared.
    fn find_long_term_reference(
        &self,
        anchor: Option<&Self::Frame>,
        poc: i32,
        lsb_bits: u32,
        msb_unknown: bool,
    ) -> Option<Self::Frame>;

    /// PicOrderCntVal of `frame`.
    fn poc_of(&self, frame: &Self::Frame) -> i32;
}

/// Soft errors raised on the picture being decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// A reference picture could not be found.
    ReferenceMissing,
    /// The picture cannot be decoded correctly.
    Major,
}

/// Receives the soft errors of the picture being decoded.
pub trait FrameErrorSink {
    fn mark_error(&mut self, error: FrameError);
}

/// A [`FrameErrorSink`] that records which errors were raised.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameErrors {
    pub reference_missing: bool,
    pub major: bool,
}

impl FrameErrors {
    pub fn any(&self) -> bool {
        self.reference_missing || self.major
    }
}

impl FrameErrorSink for FrameErrors {
    fn mark_error(&mut self, error: FrameError) {
        match error {
            FrameError::ReferenceMissing => self.reference_missing = true,
            FrameError::Major => self.major = true,
        }
    }
}

// Shortcut to refer to a DPB entry.
//
// The first member of the tuple is the `PictureData` for the frame.
//
// The second member is the backend handle of the frame.
#[derive(Clone, Debug)]
pub struct DpbEntry<T>(pub Rc<RefCell<PictureData>>, pub T);

pub struct Dpb<T> {
    /// List of `PictureData` and backend handles to decoded pictures.
    entries: Vec<DpbEntry<T>>,
    /// The maximum number of pictures that can be stored.
    max_num_pics: usize,
}

impl<T: Clone> Dpb<T> {
    pub fn new(max_num_pics: usize) -> Self {
        Self {
            entries: Default::default(),
            max_num_pics,
        }
    }

    /// Returns an iterator over the underlying H265 pictures stored in the
    /// DPB.
    pub fn pictures(&self) -> impl Iterator<Item = Ref<'_, PictureData>> {
        self.entries.iter().map(|h| h.0.borrow())
    }

    /// Returns a mutable iterator over the underlying H265 pictures stored in
    /// the DPB.
    pub fn pictures_mut(&mut self) -> impl Iterator<Item = RefMut<'_, PictureData>> {
        self.entries.iter().map(|h| h.0.borrow_mut())
    }

    /// Returns the length of the DPB.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a reference to the dpb's max num pics.
    pub fn max_num_pics(&self) -> usize {
        self.max_num_pics
    }

    /// Mark all pictures in the DPB as unused for reference.
    pub fn mark_all_as_unused_for_ref(&mut self) {
        for mut picture in self.pictures_mut() {
            picture.set_reference(Reference::None);
        }
    }

    /// Removes the pictures that are no longer used for reference.
    pub fn remove_unused(&mut self) {
        self.entries.retain(|e| {
            let pic = e.0.borrow();
            let retain = pic.is_ref();
            log::debug!("Retaining pic POC: {}: {}", pic.pic_order_cnt_val, retain);
            retain
        })
    }

    /// Store a picture and its backend handle in the DPB.
    pub fn store_picture(
        &mut self,
        picture: Rc<RefCell<PictureData>>,
        handle: T,
    ) -> anyhow::Result<DpbEntry<T>> {
        if self.entries.len() >= self.max_num_pics {
            return Err(anyhow!("Can't add a picture to the DPB: DPB is full."));
        }

        log::debug!(
            "Stored picture POC {:?}, the DPB length is {:?}",
            picture.borrow().pic_order_cnt_val,
            self.entries.len()
        );

        let entry = DpbEntry(picture, handle);
        self.entries.push(entry.clone());

        Ok(entry)
    }

    /// Clears the DPB, dropping all the pictures.
    pub fn clear(&mut self) {
        log::debug!("Clearing the DPB");
        self.entries.clear();
    }
}

impl<T: Clone> ReferenceLookup for Dpb<T> {
    type Frame = DpbEntry<T>;

    fn find_short_term_reference(&self, poc: i32) -> Option<Self::Frame> {
        let position = self.pictures().position(|p| {
            matches!(p.reference(), Reference::ShortTerm) && p.pic_order_cnt_val == poc
        });

        log::debug!(
            "find_short_term_reference: {}, found position {:?}",
            poc,
            position
        );
        Some(self.entries[position?].clone())
    }

    fn find_long_term_reference(
        &self,
        anchor: Option<&Self::Frame>,
        poc: i32,
        lsb_bits: u32,
        msb_unknown: bool,
    ) -> Option<Self::Frame> {
        let mask = if msb_unknown {
            (1i32 << lsb_bits) - 1
        } else {
            -1
        };
        let anchor_order = anchor.map_or(u64::MAX, |a| a.0.borrow().decode_order);

        // The latest matching picture wins.
        let found = self
            .entries
            .iter()
            .filter(|e| {
                let pic = e.0.borrow();
                pic.is_ref()
                    && pic.decode_order < anchor_order
                    && (pic.pic_order_cnt_val & mask) == (poc & mask)
            })
            .max_by_key(|e| e.0.borrow().decode_order)
            .cloned();

        log::debug!(
            "find_long_term_reference: {} (mask {:#x}), found {:?}",
            poc,
            mask,
            found.as_ref().map(|e| e.0.borrow().pic_order_cnt_val)
        );
        found
    }

    fn poc_of(&self, frame: &Self::Frame) -> i32 {
        frame.0.borrow().pic_order_cnt_val
    }
}

impl<T: Clone> Default for Dpb<T> {
    fn default() -> Self {
        // See https://github.com/rust-lang/rust/issues/26925 on why this can't
        // be derived.
        Self {
            entries: Default::default(),
            max_num_pics: Default::default(),
        }
    }
}

impl<T: Clone> std::fmt::Debug for Dpb<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pics = self
            .entries
            .iter()
            .map(|h| &h.0)
            .enumerate()
            .collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("pictures", &pics)
            .field("max_num_pics", &self.max_num_pics)
            .finish()
    }
}
