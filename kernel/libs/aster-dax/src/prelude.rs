// SPDX-License-Identifier: MPL-2.0

pub(crate) use std::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};

pub(crate) use crate::{
    config::{PAGE_SHIFT, PAGE_SIZE, PG_PMD_COLOUR, PG_PMD_NR, PMD_SIZE},
    entry::Pfn,
    error::{Errno::*, Error},
    return_errno, return_errno_with_msg,
    util::{align_down, align_up},
};

pub(crate) use crate::Result;

pub(crate) use core::fmt::{self, Debug};

pub(crate) use log::{debug, trace, warn};
