// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One handler per request kind. Each routine decodes its typed request,
//! does the thing, and packs its typed reply; the dispatch table in
//! [`crate::dispatch`] is the only caller.

pub mod call;
pub mod dl;
pub mod fs;
pub mod mem;
pub mod proc;
