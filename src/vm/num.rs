// GFXBOOT, a stack machine for boot-time graphical menus.

// SPDX-FileCopyrightText: © 2021 Matthew Rothlisberger
// SPDX-License-Identifier: AGPL-3.0-only

// GFXBOOT is licensed under the terms of the GNU Affero General Public
// License version 3. See the top-level LICENSES directory for the
// license text.

// Find full copyright information in the top-level COPYRIGHT file.

// <>

// src/vm/num.rs

// Num objects: integers, booleans and primitive references, all held
// inline in the object record.

// <>

use super::core::{BaseType, Data, Obj, ObjId, SubType, VmResult};
use super::obj::{DumpStyle, Store};

impl Store {
    pub fn num_new(&mut self, value: i64, sub_type: SubType) -> VmResult<ObjId> {
        let id = self.new_obj(BaseType::Num)?;

        if let Some(obj) = self.get_mut(id) {
            obj.data = Data::Value(value);
            obj.sub_type = sub_type;
        }

        Ok(id)
    }

    pub fn num_value(&self, id: ObjId) -> Option<i64> {
        self.typed(id, BaseType::Num).and_then(Obj::value)
    }

    /// Value of a num with exactly this sub type
    pub fn num_subtype_value(&self, id: ObjId, sub_type: SubType) -> Option<i64> {
        self.typed(id, BaseType::Num)
            .filter(|o| o.sub_type == sub_type)
            .and_then(Obj::value)
    }

    pub(crate) fn num_dump(&self, obj: &Obj, style: DumpStyle, out: &mut String) -> bool {
        if style.refs {
            return true;
        }

        let num = obj.value().unwrap_or(0);

        if style.inspect {
            *out += &format!("{} ({:#x})", num, num);
        } else {
            *out += &num.to_string();
        }

        true
    }
}
