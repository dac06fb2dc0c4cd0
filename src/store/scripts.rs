//! Lua sources of the Redis transition scripts.
//!
//! Task scripts take `KEYS[1] = prefix`, `KEYS[2] = task id`. Chunk scripts
//! take `KEYS[1] = task id`, `KEYS[2] = chunk id`. Every script replies with
//! an integer decoded by [`super::Outcome::from_code`].

/// Shared helper that removes a task from all queue sets and deletes its
/// keys. Prepended to scripts that may delete a task.
pub const DELETE_TASK_FN: &str = r#"
local function delete_task(prefix, task_id)
  local keys = { task_id }
  for _, suffix in ipairs({ 'pending', 'active', 'errored', 'done' }) do
    local set_key = task_id .. ':chunks:' .. suffix
    local members
    if suffix == 'active' or suffix == 'errored' then
      members = redis.call('zrange', set_key, 0, -1)
    else
      members = redis.call('smembers', set_key)
    end
    for _, chunk_id in ipairs(members) do
      table.insert(keys, chunk_id)
    end
    table.insert(keys, set_key)
  end
  redis.call('srem', prefix .. 'pending', task_id)
  redis.call('zrem', prefix .. 'mapping', task_id)
  redis.call('srem', prefix .. 'aggregating', task_id)
  redis.call('zrem', prefix .. 'reducing', task_id)
  for i = 1, #keys, 500 do
    redis.call('del', unpack(keys, i, math.min(i + 499, #keys)))
  end
end
"#;

/// ARGV: worker, data.
pub const TASK_ADD: &str = r#"
local prefix, task_id = KEYS[1], KEYS[2]
if redis.call('exists', task_id) == 1 then
  return 0
end
redis.call('hset', task_id, 'type', ARGV[1], 'data', ARGV[2], 'retries', 0, 'state', 'pending')
redis.call('sadd', prefix .. 'pending', task_id)
return 1
"#;

/// ARGV: worker, data, due time.
pub const TASK_ADD_POSTPONED: &str = r#"
local prefix, task_id = KEYS[1], KEYS[2]
if redis.call('zscore', prefix .. 'postponed', task_id) then
  return 0
end
redis.call('hset', task_id .. ':postponed', 'type', ARGV[1], 'data', ARGV[2])
redis.call('zadd', prefix .. 'postponed', ARGV[3], task_id)
return 1
"#;

/// ARGV: now.
pub const TASK_POSTPONED_TO_PENDING: &str = r#"
local prefix, task_id = KEYS[1], KEYS[2]
local score = redis.call('zscore', prefix .. 'postponed', task_id)
if not score or tonumber(score) > tonumber(ARGV[1]) then
  return 0
end
if redis.call('exists', task_id) == 1 then
  return 0
end
local fields = redis.call('hmget', task_id .. ':postponed', 'type', 'data')
redis.call('zrem', prefix .. 'postponed', task_id)
redis.call('del', task_id .. ':postponed')
if not fields[1] then
  return 0
end
redis.call('hset', task_id, 'type', fields[1], 'data', fields[2], 'retries', 0, 'state', 'pending')
redis.call('sadd', prefix .. 'pending', task_id)
return 1
"#;

/// ARGV: deadline.
pub const TASK_PENDING_TO_MAPPING: &str = r#"
local prefix, task_id = KEYS[1], KEYS[2]
if redis.call('srem', prefix .. 'pending', task_id) == 0 then
  return 0
end
redis.call('zadd', prefix .. 'mapping', ARGV[1], task_id)
redis.call('hset', task_id, 'state', 'mapping')
return 1
"#;

/// ARGV: stage set name, new deadline, expected deadline, max retries or
/// empty string for a plain backoff.
pub const TASK_RETRY_STAGE: &str = r#"
local prefix, task_id = KEYS[1], KEYS[2]
local set_key = prefix .. ARGV[1]
local score = redis.call('zscore', set_key, task_id)
if not score or tonumber(score) ~= tonumber(ARGV[3]) then
  return 0
end
if ARGV[4] ~= '' then
  local retries = redis.call('hincrby', task_id, 'retries', 1)
  if retries > tonumber(ARGV[4]) then
    delete_task(prefix, task_id)
    return -1
  end
end
redis.call('zadd', set_key, ARGV[2], task_id)
return 1
"#;

/// ARGV: chunk id / chunk data pairs.
pub const TASK_MAPPING_TO_AGGREGATING: &str = r#"
local prefix, task_id = KEYS[1], KEYS[2]
if redis.call('zrem', prefix .. 'mapping', task_id) == 0 then
  return 0
end
for i = 1, #ARGV, 2 do
  redis.call('hset', ARGV[i], 'data', ARGV[i + 1], 'retries', 0)
  redis.call('sadd', task_id .. ':chunks:pending', ARGV[i])
end
redis.call('sadd', prefix .. 'aggregating', task_id)
redis.call('hset', task_id, 'state', 'aggregating')
return 1
"#;

/// ARGV: deadline.
pub const TASK_AGGREGATING_TO_REDUCING: &str = r#"
local prefix, task_id = KEYS[1], KEYS[2]
if redis.call('sismember', prefix .. 'aggregating', task_id) == 0 then
  return 0
end
local unfinished = redis.call('scard', task_id .. ':chunks:pending')
  + redis.call('zcard', task_id .. ':chunks:active')
  + redis.call('zcard', task_id .. ':chunks:errored')
if unfinished > 0 then
  return 0
end
redis.call('srem', prefix .. 'aggregating', task_id)
redis.call('zadd', prefix .. 'reducing', ARGV[1], task_id)
redis.call('hset', task_id, 'state', 'reducing', 'retries', 0)
return 1
"#;

pub const TASK_DELETE: &str = r#"
delete_task(KEYS[1], KEYS[2])
return 1
"#;

/// ARGV: deadline.
pub const TASK_EXTEND_LEASE: &str = r#"
local prefix, task_id = KEYS[1], KEYS[2]
local updated = 0
for _, stage in ipairs({ 'mapping', 'reducing' }) do
  if redis.call('zscore', prefix .. stage, task_id) then
    redis.call('zadd', prefix .. stage, ARGV[1], task_id)
    updated = 1
  end
end
return updated
"#;

/// ARGV: deadline, max retries.
pub const CHUNK_PENDING_TO_ACTIVE: &str = r#"
local task_id, chunk_id = KEYS[1], KEYS[2]
local pending = task_id .. ':chunks:pending'
if redis.call('sismember', pending, chunk_id) == 0 then
  return 0
end
redis.call('srem', pending, chunk_id)
local retries = tonumber(redis.call('hget', chunk_id, 'retries') or '0')
if retries > tonumber(ARGV[2]) then
  redis.call('del', chunk_id)
  return -1
end
redis.call('zadd', task_id .. ':chunks:active', ARGV[1], chunk_id)
return 1
"#;

/// ARGV: serialized result.
pub const CHUNK_ACTIVE_TO_DONE: &str = r#"
local task_id, chunk_id = KEYS[1], KEYS[2]
if redis.call('zrem', task_id .. ':chunks:active', chunk_id) == 0 then
  return 0
end
redis.call('sadd', task_id .. ':chunks:done', chunk_id)
redis.call('hset', chunk_id, 'result', ARGV[1])
return 1
"#;

/// ARGV: retry time, expected deadline.
pub const CHUNK_ACTIVE_TO_ERRORED: &str = r#"
local task_id, chunk_id = KEYS[1], KEYS[2]
local active = task_id .. ':chunks:active'
local score = redis.call('zscore', active, chunk_id)
if not score or tonumber(score) ~= tonumber(ARGV[2]) then
  return 0
end
redis.call('zrem', active, chunk_id)
redis.call('zadd', task_id .. ':chunks:errored', ARGV[1], chunk_id)
return 1
"#;

/// KEYS[1] = task id. ARGV: now. Replies with the number of chunks moved.
pub const CHUNK_REQUEUE: &str = r#"
local task_id = KEYS[1]
local moved = 0
for _, suffix in ipairs({ 'errored', 'active' }) do
  local set_key = task_id .. ':chunks:' .. suffix
  local due = redis.call('zrangebyscore', set_key, '-inf', ARGV[1])
  for _, chunk_id in ipairs(due) do
    redis.call('zrem', set_key, chunk_id)
    redis.call('hincrby', chunk_id, 'retries', 1)
    redis.call('sadd', task_id .. ':chunks:pending', chunk_id)
    moved = moved + 1
  end
end
return moved
"#;

/// ARGV: deadline.
pub const CHUNK_EXTEND_LEASE: &str = r#"
local task_id, chunk_id = KEYS[1], KEYS[2]
local active = task_id .. ':chunks:active'
if not redis.call('zscore', active, chunk_id) then
  return 0
end
redis.call('zadd', active, ARGV[1], chunk_id)
return 1
"#;

/// Builds a script source that can call `delete_task`.
pub fn with_delete_task(body: &str) -> String {
    format!("{}{}", DELETE_TASK_FN, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_that_delete_include_helper() {
        let source = with_delete_task(TASK_RETRY_STAGE);
        assert!(source.starts_with(DELETE_TASK_FN));
        assert!(source.contains("delete_task(prefix, task_id)"));
    }

    #[test]
    fn test_deadline_checked_scripts_compare_expected_score() {
        for script in [TASK_RETRY_STAGE, CHUNK_ACTIVE_TO_ERRORED] {
            assert!(script.contains("zscore"));
            assert!(script.contains("~="));
        }
    }
}
