//! Server-side scripts for the Redis store.
//!
//! Each script performs the whole check-and-update for one key in a single
//! atomic evaluation. Timestamps are milliseconds supplied by the caller's
//! clock, and every script returns `{allowed (0/1), remaining, reset_after_secs}`.
//! [`MemoryStore`](super::local::MemoryStore) implements the same arithmetic.

/// Token bucket
///
/// KEYS[1] = bucket key
/// ARGV[1] = capacity
/// ARGV[2] = refill rate (tokens per second)
/// ARGV[3] = weight
/// ARGV[4] = now (ms)
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local weight = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])

-- A missing bucket starts full
if tokens == nil or last_refill == nil then
    tokens = capacity
    last_refill = now
end

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + elapsed * refill_rate / 1000)

local allowed = 0
local reset_after
if tokens >= weight then
    tokens = tokens - weight
    allowed = 1
    reset_after = math.ceil((capacity - tokens) / refill_rate)
else
    -- Insufficient tokens: nothing is deducted
    reset_after = math.ceil((weight - tokens) / refill_rate)
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', math.max(now, last_refill))
redis.call('PEXPIRE', key, math.ceil(capacity / refill_rate * 1000) * 2 + 1000)

return {allowed, math.floor(tokens), reset_after}
"#;

/// Sliding window log
///
/// KEYS[1] = sorted set key
/// ARGV[1] = limit
/// ARGV[2] = window (ms)
/// ARGV[3] = weight
/// ARGV[4] = now (ms)
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local weight = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local current = redis.call('ZCARD', key)
local remaining = math.max(0, limit - current)

local allowed = 0
if current + weight <= limit then
    -- Member names stay unique: same-millisecond entries differ by position
    for i = 1, weight do
        redis.call('ZADD', key, now, now .. ':' .. (current + i))
    end
    redis.call('PEXPIRE', key, window)
    allowed = 1
end

local reset_after = math.ceil(window / 1000)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    reset_after = math.ceil((tonumber(oldest[2]) + window - now) / 1000)
end

return {allowed, remaining, math.max(1, reset_after)}
"#;

/// Fixed window counter
///
/// KEYS[1] = counter key for the current window
/// ARGV[1] = limit
/// ARGV[2] = window (ms)
/// ARGV[3] = weight
/// ARGV[4] = now (ms)
/// ARGV[5] = window start (ms), `floor(now / window) * window`
pub const FIXED_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local weight = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local window_start = tonumber(ARGV[5])

local count = redis.call('INCRBY', key, weight)
local until_next = window_start + window - now
redis.call('PEXPIRE', key, until_next + 1000)

local allowed = 0
if count <= limit then
    allowed = 1
end

return {allowed, math.max(0, limit - count), math.max(1, math.ceil(until_next / 1000))}
"#;

/// Leaky bucket
///
/// KEYS[1] = bucket key
/// ARGV[1] = rate (requests drained per window)
/// ARGV[2] = window (ms)
/// ARGV[3] = weight
/// ARGV[4] = now (ms)
pub const LEAKY_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local rate = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local weight = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'count', 'last_leak')
local count = tonumber(state[1]) or 0
local last_leak = tonumber(state[2]) or now

local elapsed = math.max(0, now - last_leak)
count = math.max(0, count - elapsed * rate / window)

local allowed = 0
local reset_after
if count >= rate then
    reset_after = math.ceil((count - rate) * window / rate / 1000)
else
    count = count + weight
    allowed = 1
    reset_after = math.ceil(count * window / rate / 1000)
end

redis.call('HSET', key, 'count', count, 'last_leak', math.max(now, last_leak))
redis.call('PEXPIRE', key, window * 2)

return {allowed, math.max(0, math.floor(rate - count)), math.max(1, reset_after)}
"#;
