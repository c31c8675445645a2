pub const fn is_aligned(value: usize, align: usize) -> Option<bool> {
  if !align.is_power_of_two() {
    return None;
  }
  Some((value & (align - 1)) == 0)
}

pub const fn align_up(value: usize, align: usize) -> Option<usize> {
  if !align.is_power_of_two() {
    return None;
  }

  let mask = align - 1;
  match value.checked_add(mask) {
    Some(sum) => Some(sum & !mask),
    None => None,
  }
}

pub const fn align_down(value: usize, align: usize) -> Option<usize> {
  if !align.is_power_of_two() {
    return None;
  }

  Some(value & !(align - 1))
}
